//! Concrete sub-context backends implementing [`crate::context::SubContext`].

pub mod kerberos;
pub mod ntlm;

#[cfg(test)]
pub mod mock;
