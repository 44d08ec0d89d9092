//! Process-wide rendering-library lifecycle.
//!
//! The underlying rendering library may only be bound once per process.
//! That state is held here explicitly, with an init-once/teardown pair,
//! instead of as an ambient module-level "loaded" flag, so tests can
//! reset it between runs.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("decoder runtime is already initialized")]
    AlreadyInitialized,
    #[error("failed to bind the rendering library: {0}")]
    Bind(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Ready,
}

static STATE: Lazy<Mutex<State>> = Lazy::new(|| Mutex::new(State::Uninitialized));

/// Mark the rendering library as bound. Fails on a second call so a
/// double bind is caught at the seam instead of inside the library.
pub fn init() -> Result<(), RuntimeError> {
    let mut state = STATE.lock();
    if *state == State::Ready {
        return Err(RuntimeError::AlreadyInitialized);
    }
    *state = State::Ready;
    Ok(())
}

pub fn is_ready() -> bool {
    *STATE.lock() == State::Ready
}

/// Reset the lifecycle. Intended for tests; a real process binds once
/// and keeps the library until exit.
pub fn teardown() {
    *STATE.lock() = State::Uninitialized;
}
