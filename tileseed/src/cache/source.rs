//! Upstream tile sources used by [`super::DiskCacheManager`].

use std::sync::Arc;
use std::time::Duration;

use super::{CacheError, CacheManager, Dimensions, DiskCacheManager};
use crate::grid::TileCoord;

/// Default request timeout for upstream HTTP fetches.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Where a cache fetches tiles it does not have.
pub trait TileSource: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &str;

    /// Fetches the encoded tile.
    fn fetch(&self, coord: &TileCoord, dimensions: Option<&Dimensions>)
        -> Result<Vec<u8>, CacheError>;
}

/// Trait for HTTP client operations.
///
/// This abstraction allows tests to replace the network with a mock.
pub trait HttpClient: Send + Sync {
    /// Performs an HTTP GET request and returns the body.
    fn get(&self, url: &str) -> Result<Vec<u8>, CacheError>;
}

/// Real HTTP client implementation using reqwest.
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    /// Creates a client with the default timeout.
    pub fn new() -> Result<Self, CacheError> {
        Self::with_timeout(DEFAULT_HTTP_TIMEOUT_SECS)
    }

    /// Creates a client with a custom timeout.
    pub fn with_timeout(timeout_secs: u64) -> Result<Self, CacheError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("tileseed/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CacheError::Source(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, url: &str) -> Result<Vec<u8>, CacheError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| CacheError::Source(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(CacheError::Source(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| CacheError::Source(format!("Failed to read response: {}", e)))
    }
}

/// Fetches tiles from an XYZ/TMS style URL template.
///
/// Supported placeholders: `{z}`, `{x}`, `{y}` and `{-y}` (row counted from
/// the bottom of a quadtree level). Dimensions are appended as query
/// parameters.
pub struct HttpTileSource<C: HttpClient> {
    template: String,
    client: C,
}

impl<C: HttpClient> HttpTileSource<C> {
    pub fn new(template: impl Into<String>, client: C) -> Self {
        Self {
            template: template.into(),
            client,
        }
    }

    /// Expands the template for one tile.
    pub fn url_for(&self, coord: &TileCoord, dimensions: Option<&Dimensions>) -> String {
        // `{-y}` is 0 once the row count of the level no longer fits in u64
        let flipped = 1u64
            .checked_shl(u32::from(coord.z))
            .map_or(0, |rows| rows.saturating_sub(1 + u64::from(coord.y)));
        let mut url = self
            .template
            .replace("{z}", &coord.z.to_string())
            .replace("{x}", &coord.x.to_string())
            .replace("{-y}", &flipped.to_string())
            .replace("{y}", &coord.y.to_string());

        if let Some(dims) = dimensions.filter(|d| !d.is_empty()) {
            let query: Vec<String> = dims.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query.join("&"));
        }
        url
    }
}

impl<C: HttpClient> TileSource for HttpTileSource<C> {
    fn name(&self) -> &str {
        &self.template
    }

    fn fetch(
        &self,
        coord: &TileCoord,
        dimensions: Option<&Dimensions>,
    ) -> Result<Vec<u8>, CacheError> {
        self.client.get(&self.url_for(coord, dimensions))
    }
}

/// Reads tiles out of another disk cache, loading them there first.
///
/// Used by exports: the destination cache seeds itself from the origin.
pub struct CacheTileSource {
    origin: Arc<DiskCacheManager>,
}

impl CacheTileSource {
    pub fn new(origin: Arc<DiskCacheManager>) -> Self {
        Self { origin }
    }
}

impl TileSource for CacheTileSource {
    fn name(&self) -> &str {
        self.origin.name()
    }

    fn fetch(
        &self,
        coord: &TileCoord,
        dimensions: Option<&Dimensions>,
    ) -> Result<Vec<u8>, CacheError> {
        self.origin
            .load_tile_coords(std::slice::from_ref(coord), dimensions, false)?;
        self.origin.read_tile(coord)
    }
}
