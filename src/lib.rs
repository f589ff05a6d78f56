// Transit data integration layer: bus route catalog and parking rules client

pub mod config;
pub mod parking_rules;
pub mod route_catalog;
pub mod transport;

// Re-export key types for convenience
pub use config::{ConfigError, ParkingRulesConfig, RetryConfig, TransitConfig};
pub use parking_rules::{
    simplify_rules, AttemptFailure, ParkingRulesApi, ParkingRulesClient, ParkingRulesError,
    SimplifiedRules,
};
pub use route_catalog::{search_line, CatalogHandle, Route, RouteCatalog, RouteLoadError};
pub use transport::{HttpTransport, ReqwestTransport, TransportError, TransportResponse};
