// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types and the process crash hook

use std::fmt;

use parking_lot::RwLock;

/// ECS error type
#[derive(Debug, Clone)]
pub enum EcsError {
    /// Entity id with a stale generation
    InvalidEntity,

    /// Component absent from the target entity or archetype
    ComponentNotFound,

    /// Shared instance id not present in the store
    SharedInstanceNotFound,

    /// Archetype not found
    ArchetypeNotFound,

    /// Hierarchy operation error (cycle, self-attach, unknown table)
    HierarchyError(String),

    /// Dependency cycle or unknown dependency in scheduler input
    SchedulingConflict(String),

    /// Task name not registered
    TaskNotFound(String),

    /// Serialization error
    SerializationError(String),

    /// Deserialization error
    DeserializationError(String),

    /// Module could not be loaded or bound
    ModuleLoadError(String),

    /// Sandbox operation rejected in the current run state
    SandboxStateError(String),

    /// IO error (file operations, etc.)
    IoError(String),
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::InvalidEntity => write!(f, "Invalid entity id"),
            EcsError::ComponentNotFound => write!(f, "Component not found"),
            EcsError::SharedInstanceNotFound => write!(f, "Shared instance not found"),
            EcsError::ArchetypeNotFound => write!(f, "Archetype not found"),
            EcsError::HierarchyError(msg) => write!(f, "Hierarchy error: {msg}"),
            EcsError::SchedulingConflict(msg) => write!(f, "Scheduling conflict: {msg}"),
            EcsError::TaskNotFound(name) => write!(f, "Task not found: {name}"),
            EcsError::SerializationError(msg) => write!(f, "Serialization error: {msg}"),
            EcsError::DeserializationError(msg) => write!(f, "Deserialization error: {msg}"),
            EcsError::ModuleLoadError(msg) => write!(f, "Module load error: {msg}"),
            EcsError::SandboxStateError(msg) => write!(f, "Sandbox state error: {msg}"),
            EcsError::IoError(msg) => write!(f, "IO error: {msg}"),
        }
    }
}

impl std::error::Error for EcsError {}

impl From<std::io::Error> for EcsError {
    fn from(err: std::io::Error) -> Self {
        EcsError::IoError(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;

/// Handler invoked on invariant breaks before the runtime panics
pub type CrashHandler = fn(&str);

fn default_crash_handler(_message: &str) {}

static CRASH_HANDLER: RwLock<CrashHandler> = RwLock::new(default_crash_handler);

/// Install a process-level crash handler.
///
/// The handler runs before the runtime panics, giving the host a chance to
/// flush logs or show a dialog. The panic still unwinds afterwards so the
/// broken invariant never propagates.
pub fn set_crash_handler(handler: CrashHandler) {
    *CRASH_HANDLER.write() = handler;
}

/// Report a schema violation or other broken invariant. Does not return.
pub fn crash(message: &str) -> ! {
    let handler = *CRASH_HANDLER.read();
    handler(message);
    panic!("{message}");
}

/// Invariant check that routes through the crash handler.
#[macro_export]
macro_rules! crash_assert {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::error::crash(&format!($($arg)*));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EcsError::SchedulingConflict("cycle between A and B".to_string());
        assert_eq!(err.to_string(), "Scheduling conflict: cycle between A and B");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: EcsError = io.into();
        assert!(matches!(err, EcsError::IoError(_)));
    }

    #[test]
    #[should_panic]
    fn test_crash_panics() {
        crash("broken invariant");
    }
}
