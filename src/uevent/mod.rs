//! Kernel uevent intake
//!
//! Wire decoding of udev monitor messages, the netlink socket they arrive
//! on, and the listener that fans decoded events out to workers.

pub mod decoder;
pub mod event;
pub mod listener;
pub mod socket;

pub use decoder::{decode, parse};
pub use event::{Action, UEvent};
pub use listener::{Listener, UeventHandler};
pub use socket::{MessageSource, UeventSocket};
