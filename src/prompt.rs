//! Context assembly and prompt construction.
//!
//! Retrieved passages are packed in rank order as
//!
//! ```text
//! Source: <metadata.source, or the document id>
//! Content: <passage>
//! ```
//!
//! blocks joined by `\n---\n`, stopping before the block that would push
//! the context past `max_chars`.

use fusion_harness_core::models::Document;

/// Packed context plus the passages that made it in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    pub text: String,
    pub used: usize,
}

fn source_label(doc: &Document) -> &str {
    doc.metadata
        .get("source")
        .map(String::as_str)
        .unwrap_or_else(|| doc.id.as_str())
}

pub fn assemble_context<'a>(docs: impl IntoIterator<Item = &'a Document>, max_chars: usize) -> Context {
    let mut parts: Vec<String> = Vec::new();
    let mut total = 0usize;
    for doc in docs {
        let block = format!("Source: {}\nContent: {}\n", source_label(doc), doc.text_chunk);
        let len = block.chars().count();
        if total + len > max_chars {
            break;
        }
        total += len;
        parts.push(block);
    }
    Context {
        used: parts.len(),
        text: parts.join("\n---\n"),
    }
}

pub fn build_prompt(question: &str, context: &Context) -> String {
    let context_text = if context.text.is_empty() {
        "(no relevant documents were found)"
    } else {
        context.text.as_str()
    };
    format!(
        "You are a helpful assistant. Use the provided context to answer the user's question accurately.\n\n\
         Context:\n{}\n\n\
         User Question: {}\n\n\
         Instructions:\n\
         1. Answer based primarily on the provided context\n\
         2. If the context doesn't contain relevant information, say so clearly\n\
         3. Be concise but thorough\n\n\
         Answer:",
        context_text, question
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_harness_core::models::Metadata;

    fn doc(text: &str, source: Option<&str>) -> Document {
        let mut meta = Metadata::new();
        if let Some(s) = source {
            meta.insert("source".into(), s.into());
        }
        Document::new(text, vec![1.0], meta)
    }

    #[test]
    fn test_blocks_joined_in_order() {
        let docs = [doc("first", Some("a.md")), doc("second", Some("b.md"))];
        let ctx = assemble_context(docs.iter(), 1000);
        assert_eq!(ctx.used, 2);
        assert_eq!(
            ctx.text,
            "Source: a.md\nContent: first\n\n---\nSource: b.md\nContent: second\n"
        );
    }

    #[test]
    fn test_falls_back_to_document_id() {
        let d = doc("text", None);
        let ctx = assemble_context([&d], 1000);
        assert!(ctx.text.starts_with(&format!("Source: {}\n", d.id)));
    }

    #[test]
    fn test_stops_at_budget() {
        let docs = [doc("x".repeat(50).as_str(), None), doc("y", None)];
        let ctx = assemble_context(docs.iter(), 40);
        assert_eq!(ctx.used, 0);
        assert!(ctx.text.is_empty());
    }

    #[test]
    fn test_prompt_mentions_missing_context() {
        let prompt = build_prompt("what is copd?", &Context::default());
        assert!(prompt.contains("no relevant documents"));
        assert!(prompt.contains("User Question: what is copd?"));
    }
}
