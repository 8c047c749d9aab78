pub mod observer;
pub mod outcome;
pub mod providers;
pub mod service;
pub mod session;
pub mod storage;

pub use observer::{SessionObserver, Subscription};
pub use outcome::{Notice, NoticeKind, Operation, OperationResult};
pub use providers::{IdentityProvider, IdentityToolkitProvider, InMemoryProvider};
pub use service::AuthService;
pub use session::{PersistenceMode, ProfileUpdate, Session};
pub use storage::SessionStore;
