//! One-shot administrative commands run from the command line.

pub mod init_ca;
pub mod revoke;
