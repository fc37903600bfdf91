use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{FileRange, HookCommand, RetrieveError, is_stopword, tokenize};

/// One match as returned by a retriever. Backends report either a
/// similarity `score` or a raw `distance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct RawHit {
    #[serde(default)]
    pub(crate) chunk_id: usize,
    #[serde(default)]
    pub(crate) text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) distance: Option<f64>,
}

pub(crate) trait Retriever {
    fn search(&self, query: &str, top_k: usize) -> Result<Vec<RawHit>, RetrieveError>;
}

/// Keyword-overlap search over the chunk texts stored in the index file.
/// Used when no retriever hook is configured.
pub(crate) struct IndexTextRetriever {
    chunks: Vec<(usize, String, HashSet<String>)>,
}

impl IndexTextRetriever {
    pub(crate) fn from_index(index: &serde_json::Value) -> Self {
        let chunks = index
            .get("metadata")
            .and_then(|m| m.as_array())
            .map(|items| {
                items
                    .iter()
                    .enumerate()
                    .filter_map(|(pos, item)| {
                        let text = item.get("text")?.as_str()?.to_string();
                        let id = item
                            .get("id")
                            .and_then(|v| v.as_u64())
                            .map(|v| v as usize)
                            .unwrap_or(pos);
                        let terms = tokenize(&text).into_iter().collect();
                        Some((id, text, terms))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { chunks }
    }

    pub(crate) fn len(&self) -> usize {
        self.chunks.len()
    }
}

impl Retriever for IndexTextRetriever {
    fn search(&self, query: &str, top_k: usize) -> Result<Vec<RawHit>, RetrieveError> {
        let mut terms: Vec<String> = tokenize(query)
            .into_iter()
            .filter(|t| !is_stopword(t))
            .collect();
        terms.sort();
        terms.dedup();
        if terms.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f64, usize)> = self
            .chunks
            .iter()
            .enumerate()
            .filter_map(|(pos, (_, _, chunk_terms))| {
                let matched = terms.iter().filter(|t| chunk_terms.contains(*t)).count();
                if matched == 0 {
                    None
                } else {
                    Some((matched as f64 / terms.len() as f64, pos))
                }
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal).then(a.1.cmp(&b.1)));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(score, pos)| {
                let (id, text, _) = &self.chunks[pos];
                RawHit {
                    chunk_id: *id,
                    text: text.clone(),
                    score: Some(score),
                    distance: None,
                }
            })
            .collect())
    }
}

#[derive(Debug, Serialize)]
struct SearchHookRequest<'a> {
    action: &'static str,
    video_file: &'a Path,
    index_file: &'a Path,
    query: &'a str,
    top_k: usize,
}

#[derive(Debug, Deserialize)]
struct SearchHookResponse {
    #[serde(default)]
    results: Vec<RawHit>,
    #[serde(default)]
    error: Option<String>,
}

/// Delegates search to the external retriever.
pub(crate) struct HookRetriever {
    hook: HookCommand,
    video: PathBuf,
    index: PathBuf,
}

impl HookRetriever {
    pub(crate) fn new(hook: HookCommand, video: PathBuf, index: PathBuf) -> Self {
        Self { hook, video, index }
    }
}

impl Retriever for HookRetriever {
    fn search(&self, query: &str, top_k: usize) -> Result<Vec<RawHit>, RetrieveError> {
        let request = SearchHookRequest {
            action: "search",
            video_file: &self.video,
            index_file: &self.index,
            query,
            top_k,
        };
        let response: SearchHookResponse = self.hook.call("search", &request)?;
        if let Some(error) = response.error {
            return Err(RetrieveError::Backend(error));
        }
        Ok(response.results)
    }
}

/// API-facing match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SearchResult {
    pub(crate) podcast_title: String,
    pub(crate) chunk_id: String,
    pub(crate) text: String,
    pub(crate) score: f64,
}

pub(crate) fn build_chunk_mapping(file_ranges: &[FileRange]) -> HashMap<usize, String> {
    let mut mapping = HashMap::new();
    for range in file_ranges {
        for chunk_id in range.start_chunk..=range.end_chunk {
            mapping.insert(chunk_id, range.file.clone());
        }
    }
    mapping
}

/// Maps a distance onto (0, 1]; higher is closer.
pub(crate) fn similarity_score(distance: f64) -> f64 {
    if distance.is_infinite() && distance > 0.0 {
        return 0.0;
    }
    if distance < 0.0 {
        return 1.0;
    }
    1.0 / (1.0 + distance)
}

pub(crate) fn transform_hit(hit: &RawHit, mapping: &HashMap<usize, String>) -> SearchResult {
    let score = match (hit.score, hit.distance) {
        (Some(score), _) => score.clamp(0.0, 1.0),
        (None, Some(distance)) => similarity_score(distance),
        (None, None) => 0.0,
    };
    SearchResult {
        podcast_title: mapping
            .get(&hit.chunk_id)
            .cloned()
            .unwrap_or_else(|| "Unknown".to_string()),
        chunk_id: format!("chunk_{}", hit.chunk_id),
        text: hit.text.clone(),
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges() -> Vec<FileRange> {
        vec![
            FileRange {
                file: "podcast1.txt".into(),
                start_chunk: 0,
                end_chunk: 10,
            },
            FileRange {
                file: "podcast2.txt".into(),
                start_chunk: 11,
                end_chunk: 20,
            },
            FileRange {
                file: "podcast3.txt".into(),
                start_chunk: 21,
                end_chunk: 25,
            },
        ]
    }

    #[test]
    fn mapping_covers_inclusive_ranges() {
        let mapping = build_chunk_mapping(&ranges());
        assert_eq!(mapping.len(), 26);
        assert_eq!(mapping[&0], "podcast1.txt");
        assert_eq!(mapping[&10], "podcast1.txt");
        assert_eq!(mapping[&11], "podcast2.txt");
        assert_eq!(mapping[&25], "podcast3.txt");
        assert!(!mapping.contains_key(&26));
        assert!(build_chunk_mapping(&[]).is_empty());
    }

    #[test]
    fn distance_to_similarity() {
        assert_eq!(similarity_score(0.0), 1.0);
        assert!((similarity_score(1.0) - 0.5).abs() < 1e-9);
        assert!((similarity_score(9.0) - 0.1).abs() < 1e-9);
        assert_eq!(similarity_score(f64::INFINITY), 0.0);
        assert_eq!(similarity_score(-1.0), 1.0);
    }

    #[test]
    fn transform_prefers_score_then_distance() {
        let mapping = build_chunk_mapping(&ranges());
        let with_score = RawHit {
            chunk_id: 5,
            text: "Roman roads".into(),
            score: Some(0.95),
            distance: Some(3.0),
        };
        assert_eq!(
            transform_hit(&with_score, &mapping),
            SearchResult {
                podcast_title: "podcast1.txt".into(),
                chunk_id: "chunk_5".into(),
                text: "Roman roads".into(),
                score: 0.95,
            }
        );

        let with_distance = RawHit {
            chunk_id: 99,
            text: String::new(),
            score: None,
            distance: Some(0.142),
        };
        let result = transform_hit(&with_distance, &mapping);
        assert_eq!(result.podcast_title, "Unknown");
        assert!(result.score > 0.87 && result.score < 0.88);
    }

    #[test]
    fn keyword_retriever_ranks_by_overlap() {
        let index = serde_json::json!({"metadata": [
            {"id": 0, "text": "The Normans crossed the channel in 1066."},
            {"id": 1, "text": "Harold fought the Normans at Hastings in 1066."},
            {"id": 2, "text": "Rome was not built in a day."}
        ]});
        let retriever = IndexTextRetriever::from_index(&index);
        assert_eq!(retriever.len(), 3);

        let hits = retriever.search("Normans at Hastings", 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, 1);
        assert_eq!(hits[0].score, Some(1.0));
        assert_eq!(hits[1].chunk_id, 0);

        assert!(retriever.search("the of and", 5).unwrap().is_empty());
        assert_eq!(retriever.search("1066", 1).unwrap().len(), 1);
    }
}
