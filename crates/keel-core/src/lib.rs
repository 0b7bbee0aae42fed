pub mod backup;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod diff;
pub mod filelist;
pub mod filter;
pub mod logging;
pub mod remote;
pub mod stats;
pub mod synthetic;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
