pub mod connection;
pub mod observer;
pub mod proxy;
pub mod tls;
pub mod worker;

pub use observer::{ObservedBody, ResponseObserver, observe};
pub use proxy::{Admission, GatewayBody, GatewayHandler};
