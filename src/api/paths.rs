//! All Paths are recorded here for use throughout this codebase
pub mod base {
    pub const ROOT: &str = "/";
    pub const HEALTH: &str = "/health";
    pub const ABOUT: &str = "/about";
}

pub mod cluster {
    pub const STATUS: &str = "/status";
    pub const NODES: &str = "/nodes/:service";
    pub const SELECT: &str = "/select/:service";
}

pub fn nodes_path(service: &str) -> String {
    cluster::NODES.replace(":service", service)
}

pub fn select_path(service: &str) -> String {
    cluster::SELECT.replace(":service", service)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(nodes_path("Login"), "/nodes/Login");
        assert_eq!(select_path("Chat"), "/select/Chat");
    }
}
