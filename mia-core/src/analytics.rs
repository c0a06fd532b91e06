//! Report, scorecard and comparison builders.
//!
//! Pure functions over the enhanced transcript and its segments; everything
//! here is deterministic so a rebuild reproduces byte-identical artifacts.

use mia_common::db::segments::TranscriptSegment;
use serde_json::{json, Value};
use std::collections::BTreeMap;

const RISK_MARKERS: &[&str] = &["risk", "blocked", "concern", "delay", "conflict"];
const ACTION_MARKERS: &[&str] = &["will", "agreed", "action", "follow up", "deadline"];

/// Build the analytics report for a meeting.
pub fn build_report(enhanced_transcript: &str, segments: &[TranscriptSegment]) -> Value {
    let lines: Vec<&str> = enhanced_transcript
        .lines()
        .filter(|l| !l.trim().is_empty())
        .collect();

    let bullets: Vec<String> = lines.iter().take(5).map(|l| l.trim().to_string()).collect();

    let risk_flags: Vec<String> = lines
        .iter()
        .filter(|l| {
            let lower = l.to_lowercase();
            RISK_MARKERS.iter().any(|m| lower.contains(m))
        })
        .map(|l| l.trim().to_string())
        .collect();

    let action_items: Vec<String> = lines
        .iter()
        .filter(|l| {
            let lower = l.to_lowercase();
            ACTION_MARKERS.iter().any(|m| lower.contains(m))
        })
        .map(|l| l.trim().to_string())
        .collect();

    let summary = if lines.is_empty() {
        "No transcript content was captured for this meeting.".to_string()
    } else {
        format!(
            "Meeting covered {} transcript segment(s) across {} speaker(s).",
            segments.len(),
            speaker_stats(segments).len().max(1)
        )
    };

    let recommendation = if risk_flags.is_empty() {
        "proceed".to_string()
    } else {
        "review_risks".to_string()
    };

    json!({
        "schema_version": "v1",
        "summary": summary,
        "bullets": bullets,
        "risk_flags": risk_flags,
        "action_items": action_items,
        "recommendation": recommendation,
        "scorecard": build_scorecard(segments),
    })
}

/// Per-criterion scores derived from transcript structure.
pub fn build_scorecard(segments: &[TranscriptSegment]) -> Value {
    let speakers = speaker_stats(segments);
    let total_chars: usize = segments.iter().map(|s| s.raw_text.chars().count()).sum();

    // Participation balance: smallest speaker share over the ideal share.
    let balance = if speakers.len() <= 1 || total_chars == 0 {
        1.0
    } else {
        let min_share = speakers
            .values()
            .map(|&chars| chars as f64 / total_chars as f64)
            .fold(f64::MAX, f64::min);
        (min_share * speakers.len() as f64).min(1.0)
    };

    let avg_confidence = {
        let confidences: Vec<f64> = segments.iter().filter_map(|s| s.confidence).collect();
        if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f64>() / confidences.len() as f64
        }
    };

    json!({
        "segments": segments.len(),
        "speakers": speakers.len(),
        "participation_balance": round2(balance),
        "avg_confidence": round2(avg_confidence),
    })
}

/// Delta stats between the raw and enhanced transcript.
pub fn build_comparison(raw: &str, enhanced: &str) -> Value {
    let raw_words = raw.split_whitespace().count();
    let enhanced_words = enhanced.split_whitespace().count();
    json!({
        "raw_chars": raw.chars().count(),
        "enhanced_chars": enhanced.chars().count(),
        "raw_words": raw_words,
        "enhanced_words": enhanced_words,
        "words_removed": raw_words.saturating_sub(enhanced_words),
    })
}

/// Render the JSON report as plain text (for `fmt=txt` artifact downloads
/// and the delivery mail body).
pub fn render_report_text(report: &Value) -> String {
    let mut lines = vec![
        format!("Summary: {}", report["summary"].as_str().unwrap_or("")),
        String::new(),
        "Bullets:".to_string(),
    ];
    for item in report["bullets"].as_array().into_iter().flatten() {
        lines.push(format!("- {}", item.as_str().unwrap_or("")));
    }
    lines.push(String::new());
    lines.push("Risk Flags:".to_string());
    for item in report["risk_flags"].as_array().into_iter().flatten() {
        lines.push(format!("- {}", item.as_str().unwrap_or("")));
    }
    lines.push(String::new());
    lines.push(format!(
        "Recommendation: {}",
        report["recommendation"].as_str().unwrap_or("")
    ));
    lines.join("\n").trim().to_string() + "\n"
}

fn speaker_stats(segments: &[TranscriptSegment]) -> BTreeMap<String, usize> {
    let mut stats = BTreeMap::new();
    for segment in segments {
        let speaker = segment.speaker.clone().unwrap_or_else(|| "unknown".to_string());
        *stats.entry(speaker).or_insert(0) += segment.raw_text.chars().count();
    }
    stats
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(seq: i64, speaker: &str, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            meeting_id: "m-1".to_string(),
            seq,
            speaker: Some(speaker.to_string()),
            raw_text: text.to_string(),
            enhanced_text: text.to_string(),
            confidence: Some(0.9),
        }
    }

    #[test]
    fn test_report_flags_risks() {
        let segments = vec![
            segment(0, "spk1", "we agreed to ship on friday"),
            segment(1, "spk2", "there is a risk the vendor slips"),
        ];
        let transcript = "we agreed to ship on friday\nthere is a risk the vendor slips";
        let report = build_report(transcript, &segments);

        assert_eq!(report["recommendation"], "review_risks");
        assert_eq!(report["risk_flags"].as_array().unwrap().len(), 1);
        assert!(!report["action_items"].as_array().unwrap().is_empty());
        assert_eq!(report["scorecard"]["speakers"], 2);
    }

    #[test]
    fn test_report_is_deterministic() {
        let segments = vec![segment(0, "spk1", "hello world")];
        let a = build_report("hello world", &segments);
        let b = build_report("hello world", &segments);
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_transcript_report() {
        let report = build_report("", &[]);
        assert_eq!(report["recommendation"], "proceed");
        assert!(report["summary"].as_str().unwrap().contains("No transcript"));
    }

    #[test]
    fn test_comparison_counts_removed_words() {
        let cmp = build_comparison("um hello there um", "Hello there");
        assert_eq!(cmp["raw_words"], 4);
        assert_eq!(cmp["enhanced_words"], 2);
        assert_eq!(cmp["words_removed"], 2);
    }

    #[test]
    fn test_render_report_text_shape() {
        let segments = vec![segment(0, "spk1", "hello")];
        let text = render_report_text(&build_report("hello", &segments));
        assert!(text.starts_with("Summary:"));
        assert!(text.contains("Bullets:"));
        assert!(text.contains("Recommendation:"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_scorecard_balance_single_speaker() {
        let segments = vec![segment(0, "spk1", "only one voice")];
        let card = build_scorecard(&segments);
        assert_eq!(card["participation_balance"], 1.0);
    }
}
