//!
//! Process-wide registry of producer and consumer group names.
//!
//! Group names must be unique across the application. Instead of leaving that
//! as a convention, `start()` registers the name here and fails fast on a
//! duplicate; `shutdown()` releases it.
//!

use crate::error::ClientError;
use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

fn groups() -> &'static Mutex<HashSet<String>> {
    static GROUPS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    GROUPS.get_or_init(|| Mutex::new(HashSet::new()))
}

fn qualify(kind: &str, group: &str) -> String {
    format!("{}/{}", kind, group)
}

pub(crate) fn register(kind: &str, group: &str) -> Result<(), ClientError> {
    let mut guard = groups().lock().unwrap_or_else(|e| e.into_inner());
    if !guard.insert(qualify(kind, group)) {
        return Err(ClientError::DuplicateGroup(group.to_owned()));
    }
    Ok(())
}

pub(crate) fn deregister(kind: &str, group: &str) {
    let mut guard = groups().lock().unwrap_or_else(|e| e.into_inner());
    guard.remove(&qualify(kind, group));
}
