pub mod buffer;
pub mod content;
pub mod load_state;
pub mod protocol;
pub mod session;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use session::{EditorSession, SessionBuilder, SessionEvent};
pub use watcher::FileChange;
