pub mod entities;
pub mod error;
pub mod events;
pub mod origin;

pub use entities::{Api, AuthType, Key, KeyRatelimit, RatelimitKind};
pub use error::{CoreError, OriginError, Result};
pub use events::{KeyEvent, KeyEventType, KeyRef};
pub use origin::{InMemoryOriginStore, OriginStore};
