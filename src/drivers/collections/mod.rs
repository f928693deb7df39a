pub mod driver;
pub mod processor;
#[cfg(test)]
pub mod processor_test;
