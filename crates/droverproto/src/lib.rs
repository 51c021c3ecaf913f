//! Protocol types for the Drover distributed compute controller.
//!
//! This crate owns everything two Drover processes must agree on: the
//! envelope framing and session codec ([`wire`]), HMAC signing ([`sign`]),
//! typed message content ([`content`]), canonical dependency descriptors
//! ([`dependency`]), the error vocabulary ([`error`]), and the shared socket
//! construction helpers ([`socket`]).

pub mod content;
pub mod dependency;
pub mod error;
pub mod sign;
pub mod socket;
pub mod wire;

pub use content::{TaskSubHeader, error_content, error_of, is_ok, ok_content};
pub use dependency::DepSpec;
pub use error::ErrorKind;
pub use sign::SigningKey;
pub use wire::{Header, Message, MsgType, Session, WireError, DELIMITER, PROTOCOL_VERSION};
