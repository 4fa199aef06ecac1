pub mod broker;
pub mod client;
pub mod messaging;
pub mod node_config;
pub mod test_util;
pub mod util;

#[cfg(test)]
mod scenarios;
