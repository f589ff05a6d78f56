// Route catalog: loads the bus routes table once at startup and answers line searches.
// A loaded catalog is immutable; reloading publishes a complete replacement.

use parking_lot::RwLock;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

// Columns every row must carry: route_id, agency_id, route_short_name,
// route_long_name, route_desc, route_type. Extra columns are ignored.
pub const REQUIRED_FIELDS: usize = 6;

// `path` is None when the catalog was read from an arbitrary reader
#[derive(Error, Debug)]
pub enum RouteLoadError {
    #[error("could not open routes file at {}: {source}", path.display())]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed routes file at {}: record {position} has {fields} columns, expected at least 6", origin(path))]
    MalformedRecord {
        path: Option<PathBuf>,
        position: u64,
        fields: usize,
    },

    #[error("error reading routes file at {}: {source}", origin(path))]
    Read {
        path: Option<PathBuf>,
        #[source]
        source: csv::Error,
    },
}

fn origin(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map_or_else(|| "<reader>".to_string(), |p| p.display().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub id: String,
    pub agency_id: String,
    pub short_name: String,
    pub long_name: String,
    pub description: String,
    pub route_type: String,
}

impl Route {
    // Exports are not always UTF-8 (Latin-1 is common); bad bytes become U+FFFD
    fn from_record(record: &csv::ByteRecord) -> Self {
        let field = |i: usize| String::from_utf8_lossy(&record[i]).into_owned();
        Self {
            id: field(0),
            agency_id: field(1),
            short_name: field(2),
            long_name: field(3),
            description: field(4),
            route_type: field(5),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.short_name, self.long_name)?;
        if !self.description.is_empty() {
            write!(f, " ({})", self.description)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RouteCatalog {
    routes: Arc<[Route]>,
}

impl Default for RouteCatalog {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl RouteCatalog {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            routes: routes.into(),
        }
    }

    // Load the catalog from a file. The file has no header row.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RouteLoadError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| RouteLoadError::NotFound {
            path: path.to_path_buf(),
            source,
        })?;

        let catalog = Self::read_routes(file, Some(path))?;
        info!(path = %path.display(), routes = catalog.len(), "routes catalog loaded");
        Ok(catalog)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, RouteLoadError> {
        Self::read_routes(reader, None)
    }

    // Any failing row aborts the whole load; a partial catalog is never returned.
    fn read_routes<R: Read>(reader: R, path: Option<&Path>) -> Result<Self, RouteLoadError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut routes = Vec::new();
        for (index, result) in reader.byte_records().enumerate() {
            let record = result.map_err(|source| RouteLoadError::Read {
                path: path.map(Path::to_path_buf),
                source,
            })?;
            if record.len() < REQUIRED_FIELDS {
                return Err(RouteLoadError::MalformedRecord {
                    path: path.map(Path::to_path_buf),
                    position: record
                        .position()
                        .map_or(index as u64 + 1, |position| position.line()),
                    fields: record.len(),
                });
            }
            routes.push(Route::from_record(&record));
        }

        Ok(Self::new(routes))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn search(&self, line: &str) -> Vec<&Route> {
        search_line(line, &self.routes)
    }
}

/// Finds the routes serving `line`.
///
/// Routes whose short name has `line` as its first run of digits win outright
/// ("25" finds "25A" and "Línea 25", but "007" does not find "7"). Only when no
/// route matches that way does the search fall back to a case-sensitive
/// substring match on the short name.
pub fn search_line<'a>(line: &str, routes: &'a [Route]) -> Vec<&'a Route> {
    let numeric: Vec<&Route> = routes
        .iter()
        .filter(|route| first_digit_run(&route.short_name) == Some(line))
        .collect();

    if !numeric.is_empty() {
        debug!(line, matches = numeric.len(), "line matched by number");
        return numeric;
    }

    let partial: Vec<&Route> = routes
        .iter()
        .filter(|route| route.short_name.contains(line))
        .collect();
    debug!(line, matches = partial.len(), "line matched by substring");
    partial
}

fn first_digit_run(text: &str) -> Option<&str> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let rest = &text[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

// Shared, reloadable view of the catalog for concurrent request handlers.
// Readers take a snapshot; a reload never mutates a catalog someone is reading.
#[derive(Debug, Default)]
pub struct CatalogHandle {
    current: RwLock<RouteCatalog>,
}

impl CatalogHandle {
    pub fn new(catalog: RouteCatalog) -> Self {
        Self {
            current: RwLock::new(catalog),
        }
    }

    pub fn snapshot(&self) -> RouteCatalog {
        self.current.read().clone()
    }

    pub fn replace(&self, catalog: RouteCatalog) {
        *self.current.write() = catalog;
    }

    // On failure the previous catalog stays in place.
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<usize, RouteLoadError> {
        let catalog = RouteCatalog::load(path)?;
        let count = catalog.len();
        self.replace(catalog);
        Ok(count)
    }
}
