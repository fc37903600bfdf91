use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tiny_http::{Header, Method, Response, Server};
use tracing::{error, info, warn};
use url::form_urlencoded;

use crate::{
    FileRange, LoadError, Retriever, SearchResult, VIDEO_EXTENSIONS, build_chunk_mapping,
    read_index, transform_hit, with_appended_extension,
};

pub(crate) const API_VERSION: &str = env!("CARGO_PKG_VERSION");
pub(crate) const DEFAULT_TOP_K: i64 = 5;
/// `--index-base` value that starts the API without loading anything.
pub(crate) const TEST_INDEX_BASE: &str = "test";

/// Video, index and metadata paths for an index base name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IndexPaths {
    pub(crate) video: PathBuf,
    pub(crate) index: PathBuf,
    pub(crate) metadata: PathBuf,
}

impl IndexPaths {
    /// The video is whichever of `<base>.mp4`, `<base>.mkv` or `<base>.avi`
    /// exists, so memories built with any codec can be served.
    pub(crate) fn from_base(base: &Path) -> Result<Self, LoadError> {
        let video = VIDEO_EXTENSIONS
            .iter()
            .map(|ext| with_appended_extension(base, ext))
            .find(|p| p.is_file())
            .ok_or_else(|| LoadError::VideoNotFound(base.to_path_buf()))?;
        let with_suffix = |suffix: &str| {
            let mut raw: OsString = base.as_os_str().to_owned();
            raw.push(suffix);
            PathBuf::from(raw)
        };
        Ok(Self {
            video,
            index: with_suffix("_index.json"),
            metadata: with_suffix("_metadata.json"),
        })
    }
}

/// Reads `file_ranges` out of a build record. A missing file or missing
/// ranges leave the mapping empty; a file that is not JSON is an error.
pub(crate) fn load_file_ranges(metadata: &Path) -> Result<Vec<FileRange>, LoadError> {
    let Ok(raw) = fs::read_to_string(metadata) else {
        warn!(path = %metadata.display(), "metadata file not found; results will be untitled");
        return Ok(Vec::new());
    };
    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| LoadError::MetadataCorrupt {
            path: metadata.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(value
        .get("file_ranges")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default())
}

pub(crate) struct LoadedIndex {
    pub(crate) retriever: Box<dyn Retriever>,
    pub(crate) chunk_mapping: HashMap<usize, String>,
}

impl LoadedIndex {
    /// Video and index must both exist. `make_retriever` receives the
    /// resolved paths and the parsed index.
    pub(crate) fn load(
        paths: &IndexPaths,
        make_retriever: impl FnOnce(&IndexPaths, &serde_json::Value) -> Box<dyn Retriever>,
    ) -> Result<Self, LoadError> {
        if !paths.video.is_file() {
            return Err(LoadError::VideoNotFound(paths.video.clone()));
        }
        if !paths.index.is_file() {
            return Err(LoadError::IndexNotFound(paths.video.clone()));
        }
        let index_json = read_index(&paths.index)?;
        let chunk_mapping = build_chunk_mapping(&load_file_ranges(&paths.metadata)?);
        info!(chunks = chunk_mapping.len(), "loaded chunk mapping");
        Ok(Self {
            retriever: make_retriever(paths, &index_json),
            chunk_mapping,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default = "default_top_k")]
    top_k: i64,
}

fn default_top_k() -> i64 {
    DEFAULT_TOP_K
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SearchResponse {
    pub(crate) query: String,
    pub(crate) results: Vec<SearchResult>,
}

#[derive(Debug)]
pub(crate) struct ApiResponse {
    pub(crate) status: u16,
    pub(crate) body: serde_json::Value,
}

impl ApiResponse {
    fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, detail: impl Into<String>) -> Self {
        Self {
            status,
            body: serde_json::json!({"detail": detail.into()}),
        }
    }
}

pub(crate) struct SearchApi {
    index: Option<LoadedIndex>,
    test_mode: bool,
}

impl SearchApi {
    pub(crate) fn new(index: LoadedIndex) -> Self {
        Self {
            index: Some(index),
            test_mode: false,
        }
    }

    /// No index; searches succeed with empty results.
    pub(crate) fn test_mode() -> Self {
        Self {
            index: None,
            test_mode: true,
        }
    }

    pub(crate) fn index_loaded(&self) -> bool {
        self.index.is_some()
    }

    pub(crate) fn handle(&self, method: &Method, url: &str, body: &str) -> ApiResponse {
        let (path, query) = url.split_once('?').unwrap_or((url, ""));
        match (method, path) {
            (Method::Options, _) => ApiResponse::ok(serde_json::json!({})),
            (Method::Get, "/health") => ApiResponse::ok(serde_json::json!({
                "status": "healthy",
                "version": API_VERSION,
                "index_loaded": self.index_loaded(),
            })),
            (Method::Post, "/search") => match serde_json::from_str::<SearchRequest>(body) {
                Ok(req) => self.search(req.query, req.top_k),
                Err(err) => ApiResponse::error(422, format!("invalid request body: {err}")),
            },
            (Method::Get, "/query") => {
                let params: HashMap<String, String> =
                    form_urlencoded::parse(query.as_bytes()).into_owned().collect();
                let top_k = match params.get("top_k") {
                    Some(raw) => match raw.parse::<i64>() {
                        Ok(v) => v,
                        Err(_) => return ApiResponse::error(422, "top_k must be an integer"),
                    },
                    None => DEFAULT_TOP_K,
                };
                let search = params.get("search").cloned().unwrap_or_default();
                self.search(search, top_k)
            }
            (_, "/health" | "/search" | "/query") => ApiResponse::error(405, "Method Not Allowed"),
            _ => ApiResponse::error(404, "Not Found"),
        }
    }

    fn search(&self, query: String, top_k: i64) -> ApiResponse {
        if query.is_empty() {
            return ApiResponse::error(422, "query must contain at least 1 character");
        }
        if top_k < 1 {
            return ApiResponse::error(422, "top_k must be greater than or equal to 1");
        }
        let Some(index) = &self.index else {
            if self.test_mode {
                return respond_with(query, Vec::new());
            }
            return ApiResponse::error(503, "Index not loaded");
        };
        match index.retriever.search(&query, top_k as usize) {
            Ok(hits) => {
                let results = hits
                    .iter()
                    .map(|hit| transform_hit(hit, &index.chunk_mapping))
                    .collect();
                respond_with(query, results)
            }
            Err(err) => {
                error!("search failed: {err}");
                ApiResponse::error(500, format!("Search failed: {err}"))
            }
        }
    }
}

fn respond_with(query: String, results: Vec<SearchResult>) -> ApiResponse {
    let response = SearchResponse { query, results };
    match serde_json::to_value(&response) {
        Ok(body) => ApiResponse::ok(body),
        Err(err) => ApiResponse::error(500, format!("encode response: {err}")),
    }
}

fn cors_headers() -> Vec<Header> {
    [
        ("Content-Type", "application/json"),
        ("Access-Control-Allow-Origin", "*"),
        ("Access-Control-Allow-Methods", "GET, POST, OPTIONS"),
        ("Access-Control-Allow-Headers", "*"),
    ]
    .into_iter()
    .filter_map(|(k, v)| Header::from_bytes(k, v).ok())
    .collect()
}

/// Serves the API until the process is stopped.
pub(crate) fn run_search_server(
    api: &SearchApi,
    host: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{host}:{port}");
    let server = Server::http(&addr).map_err(|e| io::Error::other(format!("server: {e}")))?;
    info!(index_loaded = api.index_loaded(), "search API listening on http://{addr}");

    for mut request in server.incoming_requests() {
        let mut body = String::new();
        if let Err(err) = request.as_reader().read_to_string(&mut body) {
            warn!("read body: {err}");
        }
        let method = request.method().clone();
        let url = request.url().to_string();
        let reply = api.handle(&method, &url, &body);
        info!(method = %method, url = %url, status = reply.status, "request");

        let mut response =
            Response::from_string(reply.body.to_string()).with_status_code(reply.status);
        for header in cors_headers() {
            response.add_header(header);
        }
        let _ = request.respond(response);
    }
    Ok(())
}
