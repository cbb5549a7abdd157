//! Hybrid search and ranking.
//!
//! Candidates come from two corpora: the FTS index over stored items and the
//! in-memory static command registry. Lexical scores are min-max normalized
//! to [0, 1]; semantic similarities from the vector worker are already in
//! that range. The blended score is
//!
//! `bm25_weight·lexical + vector_weight·semantic + recency + popularity + job_boost`
//!
//! where recency decays with a configurable half-life, popularity is a
//! capped additive boost from structural metadata, and the job boost is the
//! originating job's `boost` normalized by 100. Items found only by the
//! semantic side join as expansion results with a lexical component of zero.
//! When semantic search is unavailable (worker down, provider disabled,
//! query too short) results are lexical-only — never an error.

use anyhow::Result;
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::commands::{CommandRegistry, StaticCommand};
use crate::config::RetrievalConfig;
use crate::jobs::JobRegistry;
use crate::models::{IndexItem, RankedPayload, RankedResult, ResultKind};
use crate::store::Store;
use crate::worker_manager::WorkerManager;

struct LexicalCandidate {
    item: IndexItem,
    raw_score: f64,
    snippet: String,
}

#[allow(clippy::too_many_arguments)]
pub async fn perform_search(
    store: &Store,
    jobs: &JobRegistry,
    commands: &CommandRegistry,
    vectors: &Arc<WorkerManager>,
    retrieval: &RetrievalConfig,
    query: &str,
    limit: usize,
    show_recent_first: bool,
) -> Result<Vec<RankedResult>> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return browse_results(store, jobs, commands, retrieval, limit, show_recent_first).await;
    }

    let lexical = match fetch_lexical_candidates(store, &needle, retrieval.lexical_top_k).await {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!(error = %e, "lexical candidate fetch failed");
            Vec::new()
        }
    };
    let lexical_norm = normalize(&lexical.iter().map(|c| c.raw_score).collect::<Vec<_>>());

    // Rapid keystrokes collapse to one in-flight semantic query inside the
    // manager; a superseded call returns empty and we fall back to lexical.
    let semantic: HashMap<String, f64> = if needle.chars().count() > retrieval.min_semantic_len {
        match vectors
            .search(
                &needle,
                retrieval.lexical_top_k * 2,
                retrieval.semantic_debounce_ms,
            )
            .await
        {
            Ok(hits) => {
                let mut map: HashMap<String, f64> = HashMap::new();
                for (id, similarity) in hits {
                    let entry = map.entry(id).or_insert(f64::MIN);
                    *entry = entry.max(similarity as f64);
                }
                map
            }
            Err(e) => {
                debug!(error = %e, "semantic search unavailable; lexical-only results");
                HashMap::new()
            }
        }
    } else {
        HashMap::new()
    };
    let semantic_available = !semantic.is_empty();

    let now = now_ms();
    let mut results: Vec<RankedResult> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for (candidate, lex) in lexical.into_iter().zip(lexical_norm) {
        let item = candidate.item;
        seen.insert(item.id.clone());

        let vector_part = if semantic_available {
            let similarity = semantic
                .get(&item.id)
                .copied()
                .unwrap_or(retrieval.vector_floor);
            retrieval.vector_weight * similarity
        } else {
            0.0
        };

        let score = retrieval.bm25_weight * lex
            + vector_part
            + recency_boost(item.date_added, now, retrieval)
            + popularity_boost(&item, retrieval)
            + job_boost(jobs, &item, &needle);

        let snippet = if candidate.snippet.is_empty() {
            None
        } else {
            Some(candidate.snippet)
        };
        results.push(RankedResult {
            id: item.id.clone(),
            kind: ResultKind::Dynamic,
            score,
            item: RankedPayload::Dynamic(item),
            snippet,
        });
    }

    // Expansion: semantic matches the lexical side missed, lexical part 0.
    for (id, similarity) in &semantic {
        if seen.contains(id) {
            continue;
        }
        let Some(item) = lookup_item(store, id).await? else {
            continue;
        };
        let score = retrieval.vector_weight * similarity
            + recency_boost(item.date_added, now, retrieval)
            + popularity_boost(&item, retrieval)
            + job_boost(jobs, &item, &needle);
        results.push(RankedResult {
            id: item.id.clone(),
            kind: ResultKind::Dynamic,
            score,
            item: RankedPayload::Dynamic(item),
            snippet: None,
        });
    }

    // Static commands: lexical-only corpus with a small priority nudge.
    for command in commands.all() {
        if let Some(strength) =
            command_match_strength(command, &needle, retrieval.command_match_threshold)
        {
            let score = retrieval.bm25_weight * strength + f64::from(command.priority) * 0.01;
            results.push(RankedResult {
                id: command.id.clone(),
                kind: ResultKind::Command,
                score,
                item: RankedPayload::Command(command.clone()),
                snippet: None,
            });
        }
    }

    sort_ranked(&mut results);
    results.truncate(limit);
    Ok(results)
}

/// Empty-query behavior: no semantic search; commands by priority and
/// dynamic items by recency, with job boosts on the empty query allowed to
/// force items to the bottom.
async fn browse_results(
    store: &Store,
    jobs: &JobRegistry,
    commands: &CommandRegistry,
    retrieval: &RetrievalConfig,
    limit: usize,
    show_recent_first: bool,
) -> Result<Vec<RankedResult>> {
    let mut command_results: Vec<RankedResult> = commands
        .all()
        .iter()
        .map(|c| RankedResult {
            id: c.id.clone(),
            kind: ResultKind::Command,
            score: f64::from(c.priority),
            item: RankedPayload::Command(c.clone()),
            snippet: None,
        })
        .collect();
    sort_ranked(&mut command_results);

    let now = now_ms();
    let mut dynamic: Vec<RankedResult> = Vec::new();
    for job in jobs.jobs() {
        for item in store.get_all_items(job.id()).await? {
            let mut score = recency_boost(item.date_added, now, retrieval);
            if let Some(boost) = job.boost(&item, "") {
                score += boost / 100.0;
            }
            dynamic.push(RankedResult {
                id: item.id.clone(),
                kind: ResultKind::Dynamic,
                score,
                item: RankedPayload::Dynamic(item),
                snippet: None,
            });
        }
    }
    sort_ranked(&mut dynamic);

    let mut results = if show_recent_first {
        dynamic.extend(command_results);
        dynamic
    } else {
        command_results.extend(dynamic);
        command_results
    };
    results.truncate(limit);
    Ok(results)
}

fn sort_ranked(results: &mut [RankedResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

async fn fetch_lexical_candidates(
    store: &Store,
    needle: &str,
    top_k: usize,
) -> Result<Vec<LexicalCandidate>> {
    let Some(match_expr) = fts_match_expr(needle) else {
        return Ok(Vec::new());
    };

    let rows = sqlx::query(
        r#"
        SELECT records.value AS value,
               rank,
               snippet(records_fts, 3, '', '', '…', 16) AS snip
        FROM records_fts
        JOIN records
          ON records.collection = records_fts.collection
         AND records.key = records_fts.item_id
        WHERE records_fts MATCH ?
        ORDER BY rank
        LIMIT ?
        "#,
    )
    .bind(&match_expr)
    .bind(top_k as i64)
    .fetch_all(store.pool())
    .await?;

    let mut candidates = Vec::with_capacity(rows.len());
    for row in &rows {
        let json: String = row.get("value");
        let Ok(item) = serde_json::from_str::<IndexItem>(&json) else {
            continue;
        };
        let rank: f64 = row.get("rank");
        candidates.push(LexicalCandidate {
            item,
            // FTS5 rank: more negative is better. Negate so higher = better.
            raw_score: -rank,
            snippet: row.get("snip"),
        });
    }
    Ok(candidates)
}

/// Build an FTS5 prefix-match expression from the query, OR-ing terms so any
/// matching token qualifies a candidate (ranking sorts out the rest).
fn fts_match_expr(needle: &str) -> Option<String> {
    let terms: Vec<String> = needle
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"*", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Min-max normalize to [0, 1]; equal scores all normalize to 1.
fn normalize(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    scores
        .iter()
        .map(|&s| {
            if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - min) / (max - min)
            }
        })
        .collect()
}

/// Recency decays toward zero with the configured half-life.
fn recency_boost(date_added: i64, now: i64, retrieval: &RetrievalConfig) -> f64 {
    let age_days = (now - date_added).max(0) as f64 / 86_400_000.0;
    retrieval.recency_weight * (1.0 / (1.0 + age_days / retrieval.half_life_days))
}

/// Structural signals worth a small additive boost, capped.
fn popularity_boost(item: &IndexItem, retrieval: &RetrievalConfig) -> f64 {
    let mut boost: f64 = 0.0;
    if item.metadata.contains_key("due_date") {
        boost += 0.1;
    }
    if item
        .metadata
        .get("upcoming")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        boost += 0.15;
    }
    if item.metadata.contains_key("subject") {
        boost += 0.05;
    }
    boost.min(retrieval.popularity_cap)
}

/// The originating job's boost, normalized into the additive range.
fn job_boost(jobs: &JobRegistry, item: &IndexItem, query: &str) -> f64 {
    jobs.find(&item.category)
        .and_then(|job| job.boost(item, query))
        .map(|b| b / 100.0)
        .unwrap_or(0.0)
}

/// Bounded edit-distance match of a command against the query. Exact and
/// substring matches score highest; otherwise the best normalized
/// Levenshtein similarity over the text, keywords, and their tokens, gated
/// by the configured threshold.
fn command_match_strength(
    command: &StaticCommand,
    needle: &str,
    threshold: f64,
) -> Option<f64> {
    let mut best: f64 = 0.0;

    for field in std::iter::once(&command.text).chain(command.keywords.iter()) {
        let field = field.to_lowercase();
        if field == needle {
            best = best.max(1.0);
        } else if field.starts_with(needle) || field.contains(needle) {
            best = best.max(0.9);
        }
        best = best.max(strsim::normalized_levenshtein(&field, needle));
        for token in field.split_whitespace() {
            best = best.max(strsim::normalized_levenshtein(token, needle));
        }
    }

    (best >= threshold).then_some(best.min(1.0))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    fn command(id: &str, text: &str, keywords: &[&str], priority: i32) -> StaticCommand {
        StaticCommand {
            id: id.to_string(),
            text: text.to_string(),
            category: "navigation".to_string(),
            icon: None,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            priority,
            action_id: format!("nav:{}", id),
        }
    }

    fn item(id: &str, date_added: i64) -> IndexItem {
        IndexItem {
            id: id.to_string(),
            text: format!("item {}", id),
            category: "feed".to_string(),
            content: String::new(),
            date_added,
            metadata: Map::new(),
            action_id: "open".to_string(),
            render_component_id: "row".to_string(),
        }
    }

    #[test]
    fn normalize_empty() {
        assert!(normalize(&[]).is_empty());
    }

    #[test]
    fn normalize_range() {
        let norm = normalize(&[10.0, 5.0, 0.0]);
        assert!((norm[0] - 1.0).abs() < 1e-9);
        assert!((norm[1] - 0.5).abs() < 1e-9);
        assert!((norm[2] - 0.0).abs() < 1e-9);
    }

    #[test]
    fn normalize_all_equal_is_one() {
        for score in normalize(&[3.0, 3.0, 3.0]) {
            assert!((score - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn recency_never_decreases_with_freshness() {
        let retrieval = RetrievalConfig::default();
        let now = 1_700_000_000_000i64;
        let mut previous = -1.0;
        // Sweep from 60 days old to now; the boost must be monotone.
        for age_days in (0..=60).rev() {
            let boost = recency_boost(now - age_days * 86_400_000, now, &retrieval);
            assert!(boost >= previous, "age {} days regressed", age_days);
            previous = boost;
        }
        assert!(previous <= retrieval.recency_weight + 1e-9);
    }

    #[test]
    fn popularity_is_capped() {
        let retrieval = RetrievalConfig::default();
        let mut rich = item("x", 0);
        rich.metadata.insert("due_date".into(), Value::from(1));
        rich.metadata.insert("upcoming".into(), Value::Bool(true));
        rich.metadata
            .insert("subject".into(), Value::String("PHY".into()));
        assert!((popularity_boost(&rich, &retrieval) - retrieval.popularity_cap).abs() < 1e-9);

        let plain = item("y", 0);
        assert_eq!(popularity_boost(&plain, &retrieval), 0.0);
    }

    #[test]
    fn command_matching_exact_prefix_fuzzy() {
        let timetable = command("timetable", "Timetable", &["schedule"], 4);

        assert_eq!(
            command_match_strength(&timetable, "timetable", 0.6),
            Some(1.0)
        );
        // Prefix.
        assert_eq!(command_match_strength(&timetable, "time", 0.6), Some(0.9));
        // Keyword.
        assert_eq!(
            command_match_strength(&timetable, "schedule", 0.6),
            Some(1.0)
        );
        // One transposition stays above the threshold.
        let fuzzy = command_match_strength(&timetable, "timetbale", 0.6).unwrap();
        assert!(fuzzy >= 0.6 && fuzzy < 1.0);
        // Unrelated text does not match.
        assert_eq!(command_match_strength(&timetable, "quokka", 0.6), None);
    }

    #[test]
    fn fts_expr_builds_prefix_terms() {
        assert_eq!(
            fts_match_expr("physics report").as_deref(),
            Some("\"physics\"* OR \"report\"*")
        );
        assert_eq!(fts_match_expr("  ??  ").as_deref(), None);
    }

    #[test]
    fn blended_score_monotone_in_recency() {
        let retrieval = RetrievalConfig::default();
        let now = now_ms();
        // Same lexical and semantic parts; only date_added differs.
        let score_at = |date: i64| {
            retrieval.bm25_weight * 0.5
                + retrieval.vector_weight * 0.5
                + recency_boost(date, now, &retrieval)
        };
        assert!(score_at(now) > score_at(now - 30 * 86_400_000));
        assert!(score_at(now - 86_400_000) > score_at(now - 10 * 86_400_000));
    }

    #[tokio::test]
    async fn lexical_candidates_match_by_prefix() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("t.sqlite")).await.unwrap();

        let mut a = item("a", 0);
        a.text = "Physics report".to_string();
        a.content = "momentum and gravity experiment".to_string();
        let mut b = item("b", 0);
        b.text = "Cooking club".to_string();
        b.content = "cake recipes".to_string();
        store.put_item("feed", &a).await.unwrap();
        store.put_item("feed", &b).await.unwrap();

        let hits = fetch_lexical_candidates(&store, "grav", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item.id, "a");
        assert!(hits[0].raw_score.is_finite());
    }

    #[tokio::test]
    async fn removed_items_leave_the_lexical_index() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("t.sqlite")).await.unwrap();

        let mut a = item("a", 0);
        a.content = "unicorn sighting".to_string();
        store.put_item("feed", &a).await.unwrap();
        assert_eq!(
            fetch_lexical_candidates(&store, "unicorn", 10)
                .await
                .unwrap()
                .len(),
            1
        );

        store.remove("feed", "a").await.unwrap();
        assert!(fetch_lexical_candidates(&store, "unicorn", 10)
            .await
            .unwrap()
            .is_empty());
    }
}
