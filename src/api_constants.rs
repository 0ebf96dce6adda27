pub const HEALTH_ROUTE: &str = "/health";
pub const VERSION_ROUTE: &str = "/version";
pub const ABSENCES_ROUTE: &str = "/absences";
