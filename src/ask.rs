//! `fuse ask`: answer one question through the full pipeline.

use anyhow::Result;

use crate::config::Config;
use crate::engine::{Answer, RagEngine};

pub async fn run_ask(
    config: &Config,
    question: &str,
    session: &str,
    experiment: Option<String>,
    json: bool,
) -> Result<()> {
    let engine = RagEngine::from_config(config).await?;
    if engine.gateway().provider_ids().is_empty() {
        anyhow::bail!("No generation providers configured. Add [[providers]] to the config.");
    }

    let answer = match experiment {
        Some(id) => {
            engine
                .answer_in(question, session, Default::default(), Some(id.as_str()))
                .await?
        }
        None => engine.answer(question, session).await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
    } else {
        print_answer(&answer);
    }
    Ok(())
}

fn print_answer(answer: &Answer) {
    println!("{}", answer.response.text.trim());
    println!();
    println!(
        "  strategy: {}   confidence: {:.3}   latency: {} ms",
        answer.strategy_used, answer.response.confidence, answer.latency_ms
    );
    if let (Some(exp), Some(variant)) = (&answer.experiment_id, &answer.variant_id) {
        println!("  experiment: {}   variant: {}", exp, variant);
    }
    let contributors: Vec<&str> = answer
        .response
        .contributing_providers
        .iter()
        .map(String::as_str)
        .collect();
    println!("  providers: {}", contributors.join(", "));
    for r in &answer.provider_responses {
        println!(
            "    {:<16} {:<8} {:>6} ms  conf {:.3}",
            r.provider_id,
            r.status.as_str(),
            r.latency_ms,
            r.confidence
        );
    }
    if !answer.retrieved.is_empty() {
        println!("  sources:");
        for r in &answer.retrieved {
            println!("    {}. [{:.3}] {}", r.rank, r.similarity_score, r.document_ref);
        }
    }
    if answer.guard_rail_breached {
        println!("  guard-rail breached: next request in this session goes to control");
    }
}
