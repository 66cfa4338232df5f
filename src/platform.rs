//! Host capability queries used while normalizing options.

/// Whether several sockets bound to one address share its traffic at kernel
/// level, so that every event loop may own a listener of its own.
pub fn supports_reuse_port_sharding() -> bool {
    cfg!(any(
        target_os = "linux",
        target_os = "dragonfly",
        target_os = "freebsd"
    ))
}

/// Whether filesystem paths of this platform clash with URI parsing, in
/// which case everything after `unix://` is taken verbatim as the path.
pub fn unix_path_conflicts_with_uri() -> bool {
    cfg!(windows)
}

/// Number of logical cores available to the process.
pub fn num_cpus() -> usize {
    num_cpus::get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn linux_capabilities() {
        assert!(supports_reuse_port_sharding());
        assert!(!unix_path_conflicts_with_uri());
    }

    #[test]
    fn at_least_one_cpu() {
        assert!(num_cpus() >= 1);
    }
}
