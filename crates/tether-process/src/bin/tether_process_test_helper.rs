use std::{
    env,
    io::{self, Write},
    process, thread,
    time::Duration,
};

fn next_value(value: Option<String>, flag: &str) -> String {
    value.unwrap_or_else(|| {
        eprintln!("missing value for {flag}");
        process::exit(2);
    })
}

fn parse<T: std::str::FromStr>(value: Option<String>, flag: &str) -> T {
    let value = next_value(value, flag);
    value.parse().unwrap_or_else(|_| {
        eprintln!("invalid value for {flag}: {value}");
        process::exit(2);
    })
}

fn spawn_child_sleep(ms: u64) {
    let exe = env::current_exe().unwrap_or_else(|err| {
        eprintln!("failed to resolve current exe: {err}");
        process::exit(2);
    });

    let _child = process::Command::new(exe)
        .args(["--sleep-ms", &ms.to_string()])
        .spawn()
        .unwrap_or_else(|err| {
            eprintln!("failed to spawn child: {err}");
            process::exit(2);
        });
}

fn main() {
    let mut args = env::args().skip(1);
    let mut stdout = io::stdout().lock();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--print" => {
                let text = next_value(args.next(), "--print");
                writeln!(stdout, "{text}").unwrap();
                stdout.flush().unwrap();
            }
            "--stderr" => {
                let text = next_value(args.next(), "--stderr");
                eprintln!("{text}");
            }
            "--print-env" => {
                let name = next_value(args.next(), "--print-env");
                let value = env::var(&name).unwrap_or_default();
                writeln!(stdout, "{name}={value}").unwrap();
                stdout.flush().unwrap();
            }
            "--print-cwd" => {
                let cwd = env::current_dir().unwrap();
                writeln!(stdout, "cwd={}", cwd.display()).unwrap();
                stdout.flush().unwrap();
            }
            "--print-pid" => {
                writeln!(stdout, "pid={}", process::id()).unwrap();
                stdout.flush().unwrap();
            }
            "--listen-port" => {
                let port: u16 = parse(args.next(), "--listen-port");
                writeln!(stdout, "Listening on port {port}").unwrap();
                stdout.flush().unwrap();
            }
            "--sleep-ms" => {
                let ms: u64 = parse(args.next(), "--sleep-ms");
                thread::sleep(Duration::from_millis(ms));
            }
            "--spawn-child-sleep-ms" => {
                let ms: u64 = parse(args.next(), "--spawn-child-sleep-ms");
                spawn_child_sleep(ms);
            }
            "--exit-code" => {
                let code: i32 = parse(args.next(), "--exit-code");
                process::exit(code);
            }
            other => {
                eprintln!("unknown argument: {other}");
                process::exit(2);
            }
        }
    }
}
