//! Background tasks driving one link.

pub(crate) mod read;
pub(crate) mod write;
