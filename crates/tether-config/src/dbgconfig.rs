//! `${dbgconfig:NAME}` resolution.
//!
//! The table is first resolved against itself: every entry is expanded in order, pass after
//! pass, until a pass substitutes nothing. An entry that ends up referring to itself is a
//! cycle; a reference to a name that is not in the table is an error rather than being left in
//! place.

use indexmap::IndexMap;
use serde_json::Value;

use crate::expand::{expand_value, render, ExpandError};

pub const DBGCONFIG: &str = "dbgconfig";

/// Named raw values for one resolution pass, in declaration order.
pub type ExpansionTable = IndexMap<String, Value>;

pub fn expand_fixed_point(mut table: ExpansionTable) -> Result<ExpansionTable, ExpandError> {
    loop {
        let mut substituted = false;

        for index in 0..table.len() {
            let Some((key, value)) = table.get_index(index) else {
                break;
            };
            let (key, mut value) = (key.clone(), value.clone());

            expand_value(&mut value, &mut |ty, name| {
                if ty != Some(DBGCONFIG) {
                    return Ok(None);
                }
                if name == key {
                    return Err(ExpandError::Circular { key: key.clone() });
                }
                let replacement = table.get(name).map(render).ok_or_else(|| {
                    ExpandError::Undefined {
                        key: name.to_string(),
                    }
                })?;
                substituted = true;
                Ok(Some(replacement))
            })?;

            if let Some(slot) = table.get_index_mut(index).map(|(_, slot)| slot) {
                *slot = value;
            }
        }

        if !substituted {
            return Ok(table);
        }
    }
}

/// Replace `${dbgconfig:NAME}` references in `config` with values from a resolved table.
pub fn expand_dbgconfig(config: &mut Value, table: &ExpansionTable) -> Result<(), ExpandError> {
    expand_value(config, &mut |ty, name| {
        if ty != Some(DBGCONFIG) {
            return Ok(None);
        }
        table
            .get(name)
            .map(|value| Some(render(value)))
            .ok_or_else(|| ExpandError::Undefined {
                key: name.to_string(),
            })
    })
}
