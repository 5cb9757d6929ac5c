//! System prompt assembly
//!
//! Retrieved records are rendered as a labelled plain-text block and appended
//! to the mode's instructions.
//!
//! # Example Output
//! ```text
//! <knowledge-base>
//! <dataset name="reference">
//! --- Record #1 ---
//! unit: 1
//! title: Clownfish, Anemone and Hermit Crab
//! </dataset>
//! </knowledge-base>
//! ```

use futures::future::join_all;
use std::collections::{HashMap, HashSet};

use crate::knowledge::links::{LinkTitleResolver, is_link};
use crate::knowledge::types::{ScoredRecord, display_value};

/// Records retrieved from one dataset
#[derive(Debug, Clone)]
pub struct DatasetSection {
    pub dataset: String,
    pub records: Vec<ScoredRecord>,
}

/// Render sections as a `<knowledge-base>` block.
///
/// `titles` maps link values to display titles; links found there are
/// rendered as `[title](url)`.
pub fn format_knowledge_block(sections: &[DatasetSection], titles: &HashMap<String, String>) -> String {
    let mut block = String::from("<knowledge-base>\n");
    for section in sections {
        block.push_str(&format!("<dataset name=\"{}\">\n", section.dataset));
        if section.records.is_empty() {
            block.push_str("(no matching records)\n");
        }
        for (idx, scored) in section.records.iter().enumerate() {
            block.push_str(&format!("--- Record #{} ---\n", idx + 1));
            for (field, value) in scored.record.fields() {
                let text = display_value(value);
                let text = text.trim();
                let rendered = match titles.get(text) {
                    Some(title) if title != text => format!("[{title}]({text})"),
                    _ if text.is_empty() => "N/A".to_string(),
                    _ => text.replace('\n', " "),
                };
                block.push_str(&format!("{field}: {rendered}\n"));
            }
        }
        block.push_str("</dataset>\n");
    }
    block.push_str("</knowledge-base>");
    block
}

/// Resolve display titles for every link value in `sections`
pub async fn resolve_link_titles(
    sections: &[DatasetSection],
    resolver: &LinkTitleResolver,
) -> HashMap<String, String> {
    let mut seen = HashSet::new();
    let links: Vec<String> = sections
        .iter()
        .flat_map(|s| s.records.iter())
        .flat_map(|r| r.record.fields().map(|(_, v)| display_value(v).trim().to_string()))
        .filter(|v| is_link(v))
        .filter(|v| seen.insert(v.clone()))
        .collect();

    let titles = join_all(links.iter().map(|url| resolver.resolve(url))).await;
    links.into_iter().zip(titles).collect()
}

/// Instructions followed by the knowledge block
pub fn build_system_prompt(instructions: &str, knowledge_block: &str) -> String {
    let instructions = instructions.trim();
    if instructions.is_empty() {
        knowledge_block.to_string()
    } else {
        format!("{instructions}\n\n{knowledge_block}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn section(dataset: &str, values: Vec<Value>) -> DatasetSection {
        DatasetSection {
            dataset: dataset.to_string(),
            records: values
                .into_iter()
                .map(|v| ScoredRecord {
                    record: serde_json::from_value(v).unwrap(),
                    score: 1,
                })
                .collect(),
        }
    }

    #[test]
    fn test_format_single_record() {
        let sections = vec![section(
            "reference",
            vec![json!({"unit": "1", "title": "Clownfish", "notes": null})],
        )];

        let block = format_knowledge_block(&sections, &HashMap::new());

        assert!(block.starts_with("<knowledge-base>\n<dataset name=\"reference\">\n"));
        assert!(block.contains("--- Record #1 ---\nunit: 1\ntitle: Clownfish\nnotes: N/A\n"));
        assert!(block.ends_with("</dataset>\n</knowledge-base>"));
    }

    #[test]
    fn test_format_numbers_records_per_dataset() {
        let sections = vec![
            section("reference", vec![json!({"a": 1}), json!({"a": 2})]),
            section("materials", vec![json!({"b": 3})]),
        ];

        let block = format_knowledge_block(&sections, &HashMap::new());
        assert!(block.contains("--- Record #2 ---\na: 2"));
        assert!(block.contains("<dataset name=\"materials\">\n--- Record #1 ---\nb: 3"));
    }

    #[test]
    fn test_format_empty_section() {
        let sections = vec![section("reference", vec![])];
        let block = format_knowledge_block(&sections, &HashMap::new());
        assert!(block.contains("(no matching records)"));
    }

    #[test]
    fn test_format_uses_resolved_titles() {
        let sections = vec![section(
            "gallery",
            vec![json!({"image": "https://img.example.com/fish.webp", "page": "https://example.com/a"})],
        )];
        let mut titles = HashMap::new();
        titles.insert("https://example.com/a".to_string(), "Fish Facts".to_string());
        titles.insert(
            "https://img.example.com/fish.webp".to_string(),
            "https://img.example.com/fish.webp".to_string(),
        );

        let block = format_knowledge_block(&sections, &titles);
        assert!(block.contains("page: [Fish Facts](https://example.com/a)"));
        assert!(block.contains("image: https://img.example.com/fish.webp\n"));
    }

    #[test]
    fn test_build_system_prompt() {
        assert_eq!(build_system_prompt("  Be kind. ", "<kb/>"), "Be kind.\n\n<kb/>");
        assert_eq!(build_system_prompt("", "<kb/>"), "<kb/>");
    }
}
