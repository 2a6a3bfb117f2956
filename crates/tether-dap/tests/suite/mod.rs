mod client;
mod framing;
mod reverse;
