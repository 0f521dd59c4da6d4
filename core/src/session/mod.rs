// Session module: the client side of the directory protocol

pub mod address_book;
pub mod client;
pub mod events;
pub mod files;

pub use address_book::{AddressBook, AddressCacheEntry};
pub use client::{
    CandidateList, ClientSession, RegisterFailure, SessionConfig, SessionError, UsernameProvider,
};
pub use events::SessionEvent;
pub use files::FileError;
