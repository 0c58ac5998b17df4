//! Cross-component test suites exercising the gateway end to end.


#[cfg(test)]
pub mod test_helpers;
