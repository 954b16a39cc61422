/// Display version information
pub fn execute() {
    println!("bridgehead {}", env!("CARGO_PKG_VERSION"));
    println!("Links to Signal as a secondary device and relays into federated rooms");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_execute() {
        execute();
    }
}
