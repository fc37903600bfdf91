//! Podcast feed bookkeeping: RSS ingestion into a JSON state file, LLM
//! description cleaning and tagging against a taxonomy, tag repair and the
//! episode export consumed by `transcribe`.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use quick_xml::Reader as XmlReader;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    ChatBackend, ChatTurn, FeedError, Provider, attr_value, collapse_whitespace, file_timestamp,
    truncate_chars,
};

pub(crate) const DEFAULT_STATE_FILE: &str = "state.json";
pub(crate) const DEFAULT_TAXONOMY_FILE: &str = "taxonomy.json";
pub(crate) const FEED_URL_ENV: &str = "RSS_FEED_URL";
/// OpenAI model for cleaning and tagging when none is given.
pub(crate) const FEED_MODEL: &str = "gpt-4.1-mini";
/// OpenAI model for taxonomy generation when none is given.
pub(crate) const TAXONOMY_MODEL: &str = "o3-mini";

const FEED_TIMEOUT_SECS: u64 = 30;
const LLM_BATCH_SIZE: usize = 10;
const TITLE_PREVIEW_CHARS: usize = 60;
/// Rough budget for episode text sent to taxonomy generation, at four
/// characters per token.
const TAXONOMY_CONTENT_TOKENS: usize = 400_000;
const STANDALONE_FORMAT: &str = "Standalone Episodes";

pub(crate) const TAG_CATEGORIES: [&str; 3] = ["Format", "Theme", "Track"];
const REQUIRED_TAG_FIELDS: [&str; 4] = ["Format", "Theme", "Track", "episode_number"];

const CLEAN_SYSTEM_PROMPT: &str = "You clean podcast episode descriptions. \
Remove promotional content, advertisements, social media links and production credits. \
Keep only the episode summary and its historical content, in the original wording and tone. \
Do not add anything. Pay attention to content that relates to the episode title.";

const TAG_SYSTEM_PROMPT: &str =
    "You are a podcast episode tagger. Always use tags exactly as they appear in the provided taxonomy.";

const TAXONOMY_SYSTEM_PROMPT: &str = "You build minimal, efficient taxonomies for podcasts. \
Create the smallest set of categories that still classifies every episode.";

/// One `<item>` of an RSS channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FeedItem {
    pub(crate) guid: String,
    pub(crate) title: String,
    pub(crate) description: String,
    pub(crate) published_date: String,
    pub(crate) audio_url: Option<String>,
}

/// An episode as tracked in the state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct FeedEpisode {
    pub(crate) guid: String,
    #[serde(default)]
    pub(crate) title: String,
    #[serde(default)]
    pub(crate) description: String,
    #[serde(default)]
    pub(crate) published_date: String,
    #[serde(default)]
    pub(crate) audio_url: Option<String>,
    #[serde(default)]
    pub(crate) cleaned_description: Option<String>,
    #[serde(default)]
    pub(crate) tags: Option<Value>,
    #[serde(default)]
    pub(crate) ingested_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) cleaned_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) tagged_at: Option<String>,
    #[serde(flatten)]
    pub(crate) extra: serde_json::Map<String, Value>,
}

/// Every episode ever ingested, keyed by guid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct FeedState {
    #[serde(default)]
    pub(crate) episodes: BTreeMap<String, FeedEpisode>,
    #[serde(flatten)]
    pub(crate) extra: serde_json::Map<String, Value>,
}

impl FeedState {
    /// A missing file is an empty state.
    pub(crate) fn load(path: &Path) -> Result<Self, FeedError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub(crate) fn save(&self, path: &Path) -> Result<(), FeedError> {
        write_json_atomic(path, &serde_json::to_string_pretty(self)?)
    }

    /// Adds items whose guid is not tracked yet. Returns how many were added.
    pub(crate) fn merge(&mut self, items: Vec<FeedItem>) -> usize {
        let now = Utc::now().to_rfc3339();
        let mut added = 0;
        for item in items {
            let guid = item.guid.trim().to_string();
            if guid.is_empty() || self.episodes.contains_key(&guid) {
                continue;
            }
            self.episodes.insert(
                guid.clone(),
                FeedEpisode {
                    guid,
                    title: item.title,
                    description: item.description,
                    published_date: item.published_date,
                    audio_url: item.audio_url,
                    cleaned_description: None,
                    tags: None,
                    ingested_at: now.clone(),
                    cleaned_at: None,
                    tagged_at: None,
                    extra: serde_json::Map::new(),
                },
            );
            added += 1;
        }
        added
    }
}

fn write_json_atomic(path: &Path, json: &str) -> Result<(), FeedError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn fetch_feed(url: &str) -> Result<String, FeedError> {
    let agent = ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(FEED_TIMEOUT_SECS))
        .build();
    let response = match agent.get(url).call() {
        Ok(resp) => resp,
        Err(ureq::Error::Status(status, _)) => {
            return Err(FeedError::Http(format!("{url}: status {status}")));
        }
        Err(ureq::Error::Transport(err)) => {
            return Err(FeedError::Http(format!("{url}: {err}")));
        }
    };
    let mut body = String::new();
    response
        .into_reader()
        .read_to_string(&mut body)
        .map_err(|e| FeedError::Http(format!("{url}: {e}")))?;
    Ok(body)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemField {
    Guid,
    Title,
    Description,
    PubDate,
}

fn item_field(name: &[u8]) -> Option<ItemField> {
    match name {
        b"guid" => Some(ItemField::Guid),
        b"title" => Some(ItemField::Title),
        b"description" => Some(ItemField::Description),
        b"pubDate" => Some(ItemField::PubDate),
        _ => None,
    }
}

fn push_field(item: &mut FeedItem, field: ItemField, text: &str) {
    let target = match field {
        ItemField::Guid => &mut item.guid,
        ItemField::Title => &mut item.title,
        ItemField::Description => &mut item.description,
        ItemField::PubDate => &mut item.published_date,
    };
    target.push_str(text);
}

/// Items of the feed's channel. Only direct, un-prefixed children of
/// `<item>` are read, so `<itunes:title>` never shadows `<title>`. Items
/// without a guid are dropped.
pub(crate) fn parse_rss(xml: &str) -> Result<Vec<FeedItem>, FeedError> {
    let mut reader = XmlReader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut saw_channel = false;
    let mut items = Vec::new();
    let mut current: Option<FeedItem> = None;
    let mut depth = 0usize;
    let mut field: Option<ItemField> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.name();
                if let Some(item) = current.as_mut() {
                    depth += 1;
                    if depth == 1 {
                        field = item_field(name.as_ref());
                        if name.as_ref() == b"enclosure" {
                            item.audio_url = attr_value(&e, b"url");
                        }
                    }
                } else if name.as_ref() == b"channel" {
                    saw_channel = true;
                } else if name.as_ref() == b"item" && saw_channel {
                    current = Some(FeedItem::default());
                    depth = 0;
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(item) = current.as_mut() {
                    if depth == 0 && e.name().as_ref() == b"enclosure" {
                        item.audio_url = attr_value(&e, b"url");
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(item), Some(f), 1) = (current.as_mut(), field, depth) {
                    let text = t
                        .unescape()
                        .map(|c| c.into_owned())
                        .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                    push_field(item, f, &text);
                }
            }
            Ok(Event::CData(c)) => {
                if let (Some(item), Some(f), 1) = (current.as_mut(), field, depth) {
                    push_field(item, f, &String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::End(_)) => {
                if current.is_some() {
                    if depth == 0 {
                        if let Some(mut item) = current.take() {
                            item.guid = item.guid.trim().to_string();
                            if item.guid.is_empty() {
                                debug!(title = %item.title, "skipping feed item without guid");
                            } else {
                                items.push(item);
                            }
                        }
                    } else {
                        depth -= 1;
                        if depth == 0 {
                            field = None;
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(FeedError::Xml(err.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !saw_channel {
        return Err(FeedError::NoChannel);
    }
    Ok(items)
}

/// Tag text with entities decoded and whitespace collapsed.
pub(crate) fn strip_markup(description: &str) -> String {
    let mut text = String::with_capacity(description.len());
    let mut in_tag = false;
    for c in description.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    collapse_whitespace(&text)
}

/// Parses a model reply as JSON, tolerating a surrounding code fence.
pub(crate) fn parse_json_reply(reply: &str) -> Result<Value, FeedError> {
    let mut body = reply.trim();
    body = body.strip_prefix("```json").unwrap_or(body);
    body = body.strip_prefix("```").unwrap_or(body);
    body = body.strip_suffix("```").unwrap_or(body);
    serde_json::from_str(body.trim()).map_err(|e| FeedError::BadReply(e.to_string()))
}

/// Model to ask for feed work: the explicit one, else `openai_default` for
/// OpenAI, else the provider's default.
pub(crate) fn feed_model(provider: Provider, model: Option<String>, openai_default: &str) -> Option<String> {
    model.or_else(|| (provider == Provider::Openai).then(|| openai_default.to_string()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BatchSummary {
    pub(crate) pending: usize,
    pub(crate) succeeded: usize,
    pub(crate) failed: usize,
}

fn title_preview(episode: &FeedEpisode) -> String {
    truncate_chars(&episode.title, TITLE_PREVIEW_CHARS)
}

/// Cleans every description not cleaned yet. A failed call keeps the
/// markup-stripped text, so the episode still counts as cleaned.
/// `checkpoint` runs after each batch.
pub(crate) fn clean_descriptions(
    state: &mut FeedState,
    backend: &dyn ChatBackend,
    mut checkpoint: impl FnMut(&FeedState) -> Result<(), FeedError>,
) -> Result<BatchSummary, FeedError> {
    let pending: Vec<String> = state
        .episodes
        .iter()
        .filter(|(_, e)| e.cleaned_description.is_none())
        .map(|(guid, _)| guid.clone())
        .collect();
    let mut summary = BatchSummary {
        pending: pending.len(),
        ..Default::default()
    };
    if pending.is_empty() {
        println!("No episodes to clean");
        return Ok(summary);
    }
    println!("Cleaning {} episodes...", pending.len());

    for batch in pending.chunks(LLM_BATCH_SIZE) {
        for guid in batch {
            let Some(episode) = state.episodes.get_mut(guid) else {
                continue;
            };
            let basic = strip_markup(&episode.description);
            let request = format!(
                "Clean this episode description for episode titled '{}':\n\n{basic}",
                episode.title
            );
            let cleaned = match backend.complete(CLEAN_SYSTEM_PROMPT, &[ChatTurn::user(request)], None) {
                Ok(text) => {
                    println!("✓ {}", title_preview(episode));
                    summary.succeeded += 1;
                    text.trim().to_string()
                }
                Err(err) => {
                    println!("✗ {}: {err}", title_preview(episode));
                    warn!(guid = %guid, "description cleaning failed: {err}");
                    summary.failed += 1;
                    basic
                }
            };
            episode.cleaned_description = Some(cleaned);
            episode.cleaned_at = Some(Utc::now().to_rfc3339());
        }
        checkpoint(state)?;
        println!(
            "  Batch saved ({}/{})",
            summary.succeeded + summary.failed,
            summary.pending
        );
    }
    println!("Total cleaned: {} episodes", summary.succeeded + summary.failed);
    Ok(summary)
}

/// Tag vocabulary by category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct Taxonomy {
    pub(crate) categories: BTreeMap<String, Vec<String>>,
}

impl Default for Taxonomy {
    fn default() -> Self {
        let category = |tags: &[&str]| tags.iter().map(|t| t.to_string()).collect::<Vec<_>>();
        let mut categories = BTreeMap::new();
        categories.insert(
            "Format".to_string(),
            category(&["Series Episodes", STANDALONE_FORMAT, "RIHC Series"]),
        );
        categories.insert(
            "Theme".to_string(),
            category(&[
                "Ancient & Classical Civilizations",
                "Medieval & Renaissance Europe",
                "Empire, Colonialism & Exploration",
                "Modern Political History & Leadership",
                "Military History & Battles",
                "Cultural, Social & Intellectual History",
                "Science, Technology & Economic History",
                "Religious, Ideological & Philosophical History",
                "Historical Mysteries, Conspiracies & Scandals",
                "Regional & National Histories",
            ]),
        );
        categories.insert(
            "Track".to_string(),
            category(&[
                "Roman Track",
                "Medieval & Renaissance Track",
                "Colonialism & Exploration Track",
                "American History Track",
                "Military & Battles Track",
                "Modern Political History Track",
                "Cultural & Social History Track",
                "Science, Technology & Economic History Track",
                "Religious & Ideological History Track",
                "Historical Mysteries & Conspiracies Track",
                "British History Track",
                "Global Empires Track",
                "World Wars Track",
                "Ancient Civilizations Track",
                "Regional Spotlight: Latin America Track",
                "Regional Spotlight: Asia & the Middle East Track",
                "Regional Spotlight: Europe Track",
                "Regional Spotlight: Africa Track",
                "Historical Figures Track",
                "The RIHC Bonus Track",
                "Archive Editions Track",
                "Contemporary Issues Through History Track",
            ]),
        );
        Self { categories }
    }
}

impl Taxonomy {
    /// The file at `path`, or the built-in taxonomy when there is none.
    pub(crate) fn load(path: &Path) -> Result<Self, FeedError> {
        if !path.is_file() {
            debug!(path = %path.display(), "no taxonomy file; using the built-in one");
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub(crate) fn save(&self, path: &Path) -> Result<(), FeedError> {
        write_json_atomic(path, &serde_json::to_string_pretty(self)?)
    }

    pub(crate) fn tags(&self, category: &str) -> &[String] {
        self.categories.get(category).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn contains(&self, category: &str, tag: &str) -> bool {
        self.tags(category).iter().any(|t| t == tag)
    }

    pub(crate) fn render(&self) -> String {
        let mut out = String::new();
        for (category, tags) in &self.categories {
            out.push_str(&format!("\n{category}:\n"));
            for tag in tags {
                out.push_str(&format!("- {tag}\n"));
            }
        }
        out
    }

    /// Format used when an episode is left with none.
    fn fallback_formats(&self) -> Vec<Value> {
        let formats = self.tags("Format");
        let pick = formats
            .iter()
            .find(|f| f.as_str() == STANDALONE_FORMAT)
            .or_else(|| formats.first());
        pick.map(|f| vec![Value::String(f.clone())]).unwrap_or_default()
    }
}

pub(crate) fn tag_prompt(title: &str, description: &str, taxonomy: &Taxonomy) -> String {
    format!(
        "Analyze this history podcast episode and assign ALL relevant tags from the taxonomy below.\n\
         Tags must stay in the language of the episode; do not translate them.\n\n\
         Episode Title: {title}\n\
         Episode Description: {description}\n\n\
         Rules:\n\
         1. Select 1-3 Format tags (the structure or type of the episode).\n\
         2. Select 1-3 Theme tags (the broad subject areas).\n\
         3. Select 1-3 Track tags (the specific topics covered).\n\
         4. If the episode is part of a numbered series, extract the episode number.\n\
         5. Use ONLY tags that appear exactly in the taxonomy, each in its own category. Never invent tags.\n\
         6. Never return an empty category; when nothing fits well, choose the closest general tag.\n\n\
         Valid tags by category (an episode can have several tags per category):\n{}\n\
         Return only JSON in this exact format:\n\
         {{\"Format\": [\"tag1\"], \"Theme\": [\"tag1\", \"tag2\"], \"Track\": [\"tag1\", \"tag2\"], \"episode_number\": number_or_null}}\n",
        taxonomy.render()
    )
}

/// Tags every cleaned, untagged episode. Failed or unparseable replies
/// leave the episode untagged for the next run.
pub(crate) fn tag_episodes(
    state: &mut FeedState,
    backend: &dyn ChatBackend,
    taxonomy: &Taxonomy,
    mut checkpoint: impl FnMut(&FeedState) -> Result<(), FeedError>,
) -> Result<BatchSummary, FeedError> {
    let pending: Vec<String> = state
        .episodes
        .iter()
        .filter(|(_, e)| e.tags.is_none() && e.cleaned_description.is_some())
        .map(|(guid, _)| guid.clone())
        .collect();
    let mut summary = BatchSummary {
        pending: pending.len(),
        ..Default::default()
    };
    if pending.is_empty() {
        println!("No episodes to tag");
        return Ok(summary);
    }
    println!("Tagging {} episodes...", pending.len());

    for batch in pending.chunks(LLM_BATCH_SIZE) {
        for guid in batch {
            let Some(episode) = state.episodes.get_mut(guid) else {
                continue;
            };
            let description = episode.cleaned_description.clone().unwrap_or_default();
            let prompt = tag_prompt(&episode.title, &description, taxonomy);
            let reply = backend
                .complete(TAG_SYSTEM_PROMPT, &[ChatTurn::user(prompt)], None)
                .map_err(FeedError::from)
                .and_then(|text| parse_json_reply(&text));
            match reply {
                Ok(tags) => {
                    println!("✓ {}", title_preview(episode));
                    episode.tags = Some(tags);
                    episode.tagged_at = Some(Utc::now().to_rfc3339());
                    summary.succeeded += 1;
                }
                Err(err) => {
                    println!("✗ {}: {err}", title_preview(episode));
                    warn!(guid = %guid, "tagging failed: {err}");
                    summary.failed += 1;
                }
            }
        }
        checkpoint(state)?;
        println!("  Batch saved ({}/{})", summary.succeeded, summary.pending);
    }
    println!("Total tagged: {} episodes", summary.succeeded);
    Ok(summary)
}

fn describe_tag(value: &Value) -> String {
    value
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

/// Problems with one episode's tags; empty when they are valid.
pub(crate) fn validate_tags(tags: &Value, taxonomy: &Taxonomy) -> Vec<String> {
    let Some(map) = tags.as_object() else {
        return vec!["tags must be an object".to_string()];
    };
    let mut errors = Vec::new();

    let missing: Vec<&str> = REQUIRED_TAG_FIELDS
        .iter()
        .copied()
        .filter(|field| !map.contains_key(*field))
        .collect();
    if !missing.is_empty() {
        errors.push(format!("Missing fields: {}", missing.join(", ")));
    }

    for category in TAG_CATEGORIES {
        let Some(value) = map.get(category) else {
            continue;
        };
        let Some(items) = value.as_array() else {
            errors.push(format!("{category} must be a list"));
            continue;
        };
        let invalid: Vec<String> = items
            .iter()
            .filter(|v| !v.as_str().is_some_and(|t| taxonomy.contains(category, t)))
            .map(describe_tag)
            .collect();
        if !invalid.is_empty() {
            errors.push(format!("Invalid {category} tags: {}", invalid.join(", ")));
        }
        if items.is_empty() {
            errors.push(format!("{category} cannot be empty"));
        }
    }

    if let Some(number) = map.get("episode_number") {
        if !number.is_null() && !number.is_i64() && !number.is_u64() {
            errors.push("episode_number must be int or null".to_string());
        }
    }
    errors
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ValidationReport {
    pub(crate) valid: usize,
    pub(crate) invalid: usize,
    pub(crate) errors: Vec<String>,
}

pub(crate) fn validate_state(state: &FeedState, taxonomy: &Taxonomy) -> ValidationReport {
    let mut report = ValidationReport::default();
    for episode in state.episodes.values() {
        let Some(tags) = &episode.tags else {
            continue;
        };
        let errors = validate_tags(tags, taxonomy);
        if errors.is_empty() {
            report.valid += 1;
        } else {
            report.invalid += 1;
            report
                .errors
                .push(format!("{}: {}", title_preview(episode), errors.join("; ")));
        }
    }
    report
}

fn keep_known(items: &[Value], category: &str, taxonomy: &Taxonomy) -> Vec<Value> {
    items
        .iter()
        .filter(|v| v.as_str().is_some_and(|t| taxonomy.contains(category, t)))
        .cloned()
        .collect()
}

/// Repairs what can be repaired in place and returns what was changed.
pub(crate) fn fix_tags(tags: &mut Value, taxonomy: &Taxonomy) -> Vec<String> {
    let mut fixes = Vec::new();
    let Some(map) = tags.as_object_mut() else {
        return fixes;
    };

    if !map.contains_key("episode_number") {
        map.insert("episode_number".to_string(), Value::Null);
        fixes.push("added episode_number".to_string());
    }
    for category in TAG_CATEGORIES {
        if !map.contains_key(category) {
            map.insert(category.to_string(), Value::Array(Vec::new()));
            fixes.push(format!("added empty {category}"));
        }
    }

    let mut formats = match map.remove("Format") {
        Some(Value::Array(items)) => items,
        other => {
            fixes.push("converted Format to list".to_string());
            match other {
                Some(Value::String(s)) => vec![Value::String(s)],
                _ => taxonomy.fallback_formats(),
            }
        }
    };
    let known = keep_known(&formats, "Format", taxonomy);
    if known.len() != formats.len() {
        formats = if known.is_empty() {
            taxonomy.fallback_formats()
        } else {
            known
        };
        fixes.push("removed invalid Format tags".to_string());
    }
    map.insert("Format".to_string(), Value::Array(formats));

    for category in ["Theme", "Track"] {
        let items = match map.remove(category) {
            Some(Value::Array(items)) => items,
            other => {
                fixes.push(format!("converted {category} to list"));
                match other {
                    Some(Value::String(s)) => vec![Value::String(s)],
                    _ => Vec::new(),
                }
            }
        };
        let known = keep_known(&items, category, taxonomy);
        if known.len() != items.len() {
            fixes.push(format!("removed invalid {category} tags"));
        }
        map.insert(category.to_string(), Value::Array(known));
    }

    let number = map.get("episode_number").cloned().unwrap_or(Value::Null);
    match number {
        Value::Null => {}
        Value::Number(n) if n.is_i64() || n.is_u64() => {}
        Value::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => {
            let fixed = s.parse::<u64>().map(Value::from).unwrap_or(Value::Null);
            map.insert("episode_number".to_string(), fixed);
            fixes.push("converted episode_number to int".to_string());
        }
        _ => {
            map.insert("episode_number".to_string(), Value::Null);
            fixes.push("reset invalid episode_number".to_string());
        }
    }
    fixes
}

/// Runs [`fix_tags`] over every tagged episode. Tags still invalid after
/// repair are deleted so the episode is tagged again.
pub(crate) fn fix_state(state: &mut FeedState, taxonomy: &Taxonomy) -> Vec<String> {
    let mut report = Vec::new();
    for episode in state.episodes.values_mut() {
        let Some(tags) = episode.tags.as_mut() else {
            continue;
        };
        let mut fixes = fix_tags(tags, taxonomy);
        let errors = validate_tags(tags, taxonomy);
        if !errors.is_empty() {
            episode.tags = None;
            episode.tagged_at = None;
            fixes = vec![format!(
                "DELETED ALL TAGS - validation failed after fixes: {}",
                errors.join("; ")
            )];
        }
        if !fixes.is_empty() {
            report.push(format!("{}: {}", title_preview(episode), fixes.join(", ")));
        }
    }
    report
}

pub(crate) fn taxonomy_prompt(state: &FeedState) -> Result<String, FeedError> {
    let described: Vec<&FeedEpisode> = state
        .episodes
        .values()
        .filter(|e| e.cleaned_description.as_deref().is_some_and(|d| !d.is_empty()))
        .collect();
    if described.is_empty() {
        return Err(FeedError::NothingCleaned);
    }

    let mut episodes_text = String::new();
    let mut tokens = 0usize;
    let mut included = 0usize;
    for episode in &described {
        let entry = format!(
            "Title: {}\nDescription: {}\n\n",
            episode.title,
            episode.cleaned_description.as_deref().unwrap_or_default()
        );
        let entry_tokens = entry.len() / 4;
        if tokens + entry_tokens > TAXONOMY_CONTENT_TOKENS {
            break;
        }
        episodes_text.push_str(&entry);
        tokens += entry_tokens;
        included += 1;
    }
    info!(included, total = described.len(), tokens, "building taxonomy prompt");

    Ok(format!(
        "Analyze these podcast episodes and create a MINIMAL but COMPREHENSIVE taxonomy,\n\
         written in the language of the episodes.\n\n\
         Requirements:\n\
         - Format: 3-7 types (how episodes are structured: interviews, discussions, series...)\n\
         - Theme: 5-8 broad subject areas\n\
         - Track: 8-15 specific recurring topics\n\
         - Every episode must fit at least one tag of each category.\n\
         - Prefer fewer, broader tags; merge similar concepts; include a catch-all if needed.\n\n\
         PODCAST EPISODES ({included} of {} total):\n{episodes_text}\n\
         Return ONLY a JSON object in this exact format:\n\
         {{\"Format\": [\"format1\", ...], \"Theme\": [\"theme1\", ...], \"Track\": [\"track1\", ...]}}",
        described.len()
    ))
}

/// Asks the model for a taxonomy built from the cleaned descriptions.
pub(crate) fn generate_taxonomy(
    state: &FeedState,
    backend: &dyn ChatBackend,
) -> Result<Taxonomy, FeedError> {
    let prompt = taxonomy_prompt(state)?;
    let reply = backend.complete(TAXONOMY_SYSTEM_PROMPT, &[ChatTurn::user(prompt)], None)?;
    Ok(serde_json::from_value(parse_json_reply(&reply)?)?)
}

/// One line of the episode export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ExportedEpisode {
    pub(crate) guid: String,
    pub(crate) title: String,
    pub(crate) published_date: String,
    pub(crate) audio_url: Option<String>,
    pub(crate) tags: Value,
    pub(crate) cleaned_description: Option<String>,
}

/// Tagged episodes, newest first. Dates that do not parse sort last.
pub(crate) fn tagged_export(state: &FeedState) -> Vec<ExportedEpisode> {
    let mut dated: Vec<(Option<DateTime<Utc>>, ExportedEpisode)> = state
        .episodes
        .values()
        .filter_map(|e| {
            let tags = e.tags.clone()?;
            let date = DateTime::parse_from_rfc2822(e.published_date.trim())
                .ok()
                .map(|d| d.with_timezone(&Utc));
            Some((
                date,
                ExportedEpisode {
                    guid: e.guid.clone(),
                    title: e.title.clone(),
                    published_date: e.published_date.clone(),
                    audio_url: e.audio_url.clone(),
                    tags,
                    cleaned_description: e.cleaned_description.clone(),
                },
            ))
        })
        .collect();
    dated.sort_by_key(|(date, _)| Reverse(*date));
    dated.into_iter().map(|(_, episode)| episode).collect()
}

/// Writes `export_<timestamp>.json` into `output_dir`.
pub(crate) fn write_export(
    state: &FeedState,
    output_dir: &Path,
) -> Result<(PathBuf, usize), FeedError> {
    let episodes = tagged_export(state);
    fs::create_dir_all(output_dir)?;
    let path = output_dir.join(format!("export_{}.json", file_timestamp()));
    fs::write(&path, serde_json::to_string_pretty(&episodes)?)?;
    Ok((path, episodes.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Episode, LlmError};
    use std::cell::RefCell;
    use std::io::Write;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd">
  <channel>
    <title>The Rest Is History</title>
    <item>
      <title>Hastings &amp; After</title>
      <itunes:title>Ignored</itunes:title>
      <guid isPermaLink="false"> ep-1066 </guid>
      <description><![CDATA[<p>The Normans <b>arrive</b>.</p>]]></description>
      <pubDate>Sat, 14 Oct 2023 09:00:00 +0000</pubDate>
      <enclosure url="https://cdn.example.com/1066.mp3" length="1" type="audio/mpeg"/>
    </item>
    <item>
      <title>No guid here</title>
    </item>
    <item>
      <title>Agincourt</title>
      <guid>ep-1415</guid>
      <pubDate>Wed, 25 Oct 2023 09:00:00 +0000</pubDate>
    </item>
  </channel>
</rss>"#;

    struct FnBackend<F: Fn(&str) -> Result<String, LlmError>> {
        reply: F,
        prompts: RefCell<Vec<String>>,
    }

    impl<F: Fn(&str) -> Result<String, LlmError>> FnBackend<F> {
        fn new(reply: F) -> Self {
            Self {
                reply,
                prompts: RefCell::new(Vec::new()),
            }
        }
    }

    impl<F: Fn(&str) -> Result<String, LlmError>> ChatBackend for FnBackend<F> {
        fn describe(&self) -> String {
            "scripted".into()
        }

        fn complete(
            &self,
            _system: &str,
            turns: &[ChatTurn],
            _stream: Option<&mut dyn Write>,
        ) -> Result<String, LlmError> {
            let prompt = turns.last().map(|t| t.content.clone()).unwrap_or_default();
            self.prompts.borrow_mut().push(prompt.clone());
            (self.reply)(&prompt)
        }
    }

    fn episode(guid: &str, title: &str, date: &str) -> FeedEpisode {
        FeedEpisode {
            guid: guid.into(),
            title: title.into(),
            description: format!("<p>About {title}</p>"),
            published_date: date.into(),
            audio_url: Some(format!("https://cdn.example.com/{guid}.mp3")),
            cleaned_description: None,
            tags: None,
            ingested_at: String::new(),
            cleaned_at: None,
            tagged_at: None,
            extra: serde_json::Map::new(),
        }
    }

    fn state_of(episodes: Vec<FeedEpisode>) -> FeedState {
        FeedState {
            episodes: episodes.into_iter().map(|e| (e.guid.clone(), e)).collect(),
            extra: serde_json::Map::new(),
        }
    }

    fn valid_tags() -> Value {
        serde_json::json!({
            "Format": ["Series Episodes"],
            "Theme": ["Military History & Battles"],
            "Track": ["Military & Battles Track"],
            "episode_number": 3
        })
    }

    #[test]
    fn rss_items_are_parsed() {
        let items = parse_rss(FEED).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].guid, "ep-1066");
        assert_eq!(items[0].title, "Hastings & After");
        assert_eq!(items[0].description, "<p>The Normans <b>arrive</b>.</p>");
        assert_eq!(items[0].published_date, "Sat, 14 Oct 2023 09:00:00 +0000");
        assert_eq!(items[0].audio_url.as_deref(), Some("https://cdn.example.com/1066.mp3"));
        assert_eq!(items[1].guid, "ep-1415");
        assert_eq!(items[1].audio_url, None);
    }

    #[test]
    fn feed_without_channel_is_rejected() {
        let err = parse_rss("<rss><item><guid>x</guid></item></rss>").unwrap_err();
        assert!(matches!(err, FeedError::NoChannel));
        let err = parse_rss("<rss><channel><item></channel></rss>").unwrap_err();
        assert!(matches!(err, FeedError::Xml(_)));
    }

    #[test]
    fn merge_adds_only_unseen_guids() {
        let mut state = state_of(vec![episode("ep-1066", "Old title", "")]);
        state.episodes.get_mut("ep-1066").unwrap().cleaned_description = Some("kept".into());

        let added = state.merge(parse_rss(FEED).unwrap());
        assert_eq!(added, 1);
        assert_eq!(state.episodes.len(), 2);
        let kept = &state.episodes["ep-1066"];
        assert_eq!(kept.title, "Old title");
        assert_eq!(kept.cleaned_description.as_deref(), Some("kept"));
        assert!(!state.episodes["ep-1415"].ingested_at.is_empty());
        assert_eq!(state.merge(parse_rss(FEED).unwrap()), 0);
    }

    #[test]
    fn state_file_round_trip_keeps_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert!(FeedState::load(&path).unwrap().episodes.is_empty());

        fs::write(
            &path,
            r#"{"episodes":{"g1":{"guid":"g1","title":"T","description":"","published_date":"",
                "audio_url":null,"cleaned_description":null,"tags":null,"ingested_at":"2024-01-01T00:00:00",
                "listened":true}},"feed_etag":"abc"}"#,
        )
        .unwrap();
        let state = FeedState::load(&path).unwrap();
        state.save(&path).unwrap();
        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["feed_etag"], "abc");
        assert_eq!(raw["episodes"]["g1"]["listened"], true);
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn markup_is_stripped_and_entities_decoded() {
        assert_eq!(
            strip_markup("<p>Tom &amp; Dominic   on <a href='x'>Rome</a></p>\n&quot;SPQR&quot; &#39;25"),
            "Tom & Dominic on Rome \"SPQR\" '25"
        );
    }

    #[test]
    fn cleaning_falls_back_to_stripped_text_and_checkpoints_per_batch() {
        let episodes: Vec<FeedEpisode> = (0..12)
            .map(|i| episode(&format!("g{i:02}"), &format!("Episode {i}"), ""))
            .collect();
        let mut state = state_of(episodes);
        let backend = FnBackend::new(|prompt: &str| {
            if prompt.contains("'Episode 3'") {
                Err(LlmError::Transport {
                    provider: "openai",
                    message: "timed out".into(),
                })
            } else {
                Ok("  Clean summary.  ".to_string())
            }
        });

        let mut checkpoints = Vec::new();
        let summary = clean_descriptions(&mut state, &backend, |s| {
            checkpoints.push(s.episodes.values().filter(|e| e.cleaned_description.is_some()).count());
            Ok(())
        })
        .unwrap();

        assert_eq!(summary, BatchSummary { pending: 12, succeeded: 11, failed: 1 });
        assert_eq!(checkpoints, vec![10, 12]);
        assert_eq!(state.episodes["g03"].cleaned_description.as_deref(), Some("About Episode 3"));
        assert_eq!(state.episodes["g04"].cleaned_description.as_deref(), Some("Clean summary."));
        assert!(backend.prompts.borrow()[0].contains("About Episode 0"));

        let again = clean_descriptions(&mut state, &backend, |_| Ok(())).unwrap();
        assert_eq!(again.pending, 0);
    }

    #[test]
    fn tagging_needs_a_cleaned_description_and_parseable_reply() {
        let mut state = state_of(vec![
            episode("a", "Agincourt", ""),
            episode("b", "Bosworth", ""),
            episode("c", "Crecy", ""),
        ]);
        state.episodes.get_mut("a").unwrap().cleaned_description = Some("Henry V".into());
        state.episodes.get_mut("b").unwrap().cleaned_description = Some("Richard III".into());
        let taxonomy = Taxonomy::default();
        let backend = FnBackend::new(|prompt: &str| {
            if prompt.contains("Bosworth") {
                Ok("not json at all".to_string())
            } else {
                Ok(format!("```json\n{}\n```", valid_tags()))
            }
        });

        let summary = tag_episodes(&mut state, &backend, &taxonomy, |_| Ok(())).unwrap();
        assert_eq!(summary, BatchSummary { pending: 2, succeeded: 1, failed: 1 });
        assert_eq!(state.episodes["a"].tags, Some(valid_tags()));
        assert!(state.episodes["a"].tagged_at.is_some());
        assert!(state.episodes["b"].tags.is_none());
        assert!(state.episodes["c"].tags.is_none());

        let prompt = &backend.prompts.borrow()[0];
        assert!(prompt.contains("Episode Title: Agincourt"));
        assert!(prompt.contains("- Roman Track"));
    }

    #[test]
    fn validation_reports_each_problem() {
        let taxonomy = Taxonomy::default();
        assert!(validate_tags(&valid_tags(), &taxonomy).is_empty());

        let bad = serde_json::json!({
            "Format": "Series Episodes",
            "Theme": [],
            "Track": ["Roman Track", "Pirates Track"],
            "episode_number": "7"
        });
        assert_eq!(
            validate_tags(&bad, &taxonomy),
            vec![
                "Format must be a list",
                "Theme cannot be empty",
                "Invalid Track tags: Pirates Track",
                "episode_number must be int or null",
            ]
        );
        assert_eq!(
            validate_tags(&serde_json::json!({"Format": ["Series Episodes"]}), &taxonomy),
            vec!["Missing fields: Theme, Track, episode_number"]
        );
    }

    #[test]
    fn fixing_repairs_what_it_can() {
        let taxonomy = Taxonomy::default();
        let mut tags = serde_json::json!({
            "Format": "Series Episodes",
            "Theme": ["Military History & Battles", "Dragons"],
            "Track": "Roman Track",
            "episode_number": "12"
        });
        let fixes = fix_tags(&mut tags, &taxonomy);
        assert_eq!(
            fixes,
            vec![
                "converted Format to list",
                "removed invalid Theme tags",
                "converted Track to list",
                "converted episode_number to int",
            ]
        );
        assert_eq!(
            tags,
            serde_json::json!({
                "Format": ["Series Episodes"],
                "Theme": ["Military History & Battles"],
                "Track": ["Roman Track"],
                "episode_number": 12
            })
        );
        assert!(validate_tags(&tags, &taxonomy).is_empty());

        let mut unknown_format = serde_json::json!({"Format": ["Quiz"], "Theme": [], "Track": [], "episode_number": 1.5});
        fix_tags(&mut unknown_format, &taxonomy);
        assert_eq!(unknown_format["Format"], serde_json::json!(["Standalone Episodes"]));
        assert_eq!(unknown_format["episode_number"], Value::Null);
    }

    #[test]
    fn unfixable_tags_are_deleted() {
        let mut good = episode("good", "Good", "");
        good.tags = Some(valid_tags());
        let mut broken = episode("broken", "Broken", "");
        broken.tags = Some(serde_json::json!({"Format": ["Series Episodes"], "Theme": ["Nope"]}));
        broken.tagged_at = Some("then".into());
        let mut state = state_of(vec![good, broken]);

        let report = fix_state(&mut state, &Taxonomy::default());
        assert_eq!(report.len(), 1);
        assert!(report[0].starts_with("Broken: DELETED ALL TAGS"));
        assert!(state.episodes["broken"].tags.is_none());
        assert!(state.episodes["broken"].tagged_at.is_none());
        assert_eq!(state.episodes["good"].tags, Some(valid_tags()));

        let summary = validate_state(&state, &Taxonomy::default());
        assert_eq!((summary.valid, summary.invalid), (1, 0));
    }

    #[test]
    fn taxonomy_generation_uses_cleaned_descriptions() {
        let empty = state_of(vec![episode("a", "A", "")]);
        let backend = FnBackend::new(|_: &str| Ok(String::new()));
        assert!(matches!(
            generate_taxonomy(&empty, &backend),
            Err(FeedError::NothingCleaned)
        ));

        let mut state = empty.clone();
        state.episodes.get_mut("a").unwrap().cleaned_description = Some("Wine of Burgundy".into());
        let backend = FnBackend::new(|_: &str| {
            Ok("```json\n{\"Format\": [\"Tasting\"], \"Theme\": [\"France\"], \"Track\": [\"Pinot\"]}\n```".into())
        });
        let taxonomy = generate_taxonomy(&state, &backend).unwrap();
        assert!(taxonomy.contains("Track", "Pinot"));
        assert!(backend.prompts.borrow()[0].contains("Description: Wine of Burgundy"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taxonomy.json");
        assert_eq!(Taxonomy::load(&path).unwrap(), Taxonomy::default());
        taxonomy.save(&path).unwrap();
        assert_eq!(Taxonomy::load(&path).unwrap(), taxonomy);
    }

    #[test]
    fn export_is_newest_first_and_feeds_transcription() {
        let mut older = episode("older", "Older", "Mon, 01 Jan 2024 10:00:00 +0000");
        older.tags = Some(valid_tags());
        let mut newer = episode("newer", "Newer", "Tue, 02 Jan 2024 10:00:00 +0000");
        newer.tags = Some(valid_tags());
        let mut undated = episode("undated", "Undated", "someday");
        undated.tags = Some(valid_tags());
        let untagged = episode("untagged", "Untagged", "Wed, 03 Jan 2024 10:00:00 +0000");
        let state = state_of(vec![older, undated, untagged, newer]);

        let dir = tempfile::tempdir().unwrap();
        let (path, count) = write_export(&state, dir.path()).unwrap();
        assert_eq!(count, 3);
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("export_"));

        let raw = fs::read_to_string(&path).unwrap();
        let exported: Vec<ExportedEpisode> = serde_json::from_str(&raw).unwrap();
        let order: Vec<&str> = exported.iter().map(|e| e.guid.as_str()).collect();
        assert_eq!(order, vec!["newer", "older", "undated"]);

        let episodes: Vec<Episode> = serde_json::from_str(&raw).unwrap();
        assert_eq!(episodes[0].audio_url.as_deref(), Some("https://cdn.example.com/newer.mp3"));
    }

    #[test]
    fn model_defaults_per_provider() {
        assert_eq!(feed_model(Provider::Openai, None, FEED_MODEL).as_deref(), Some("gpt-4.1-mini"));
        assert_eq!(feed_model(Provider::Google, None, FEED_MODEL), None);
        assert_eq!(
            feed_model(Provider::Openai, Some("gpt-4o".into()), TAXONOMY_MODEL).as_deref(),
            Some("gpt-4o")
        );
    }
}
