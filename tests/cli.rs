use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn fuse_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_fuse"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    fs::write(
        root.join("passages.jsonl"),
        concat!(
            r#"{"text": "Cargo builds Rust crates and resolves their dependencies.", "metadata": {"source": "cargo.md"}}"#,
            "\n",
            r#"{"text": "Kubernetes schedules containers across a cluster of nodes.", "metadata": {"source": "k8s.md"}}"#,
            "\n\n",
            r#"{"text": "Sourdough bread needs a lively starter and a long proof.", "metadata": {"source": "bread.md"}}"#,
            "\n",
        ),
    )
    .unwrap();

    fs::write(
        root.join("experiment.toml"),
        r#"id = "fusion-ab"

[guard_rails]
min_confidence = 0.4
control_variant = "control"

[[variants]]
id = "control"
strategy = "weighted_average"
allocation_weight = 0.5

[[variants]]
id = "routing"
strategy = "confidence_routing"
allocation_weight = 0.5
"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/fuse.sqlite"

[retrieval]
top_k = 3

[embedding]
provider = "hashing"
dims = 256
"#,
        root.display()
    );
    let config_path = config_dir.join("fuse.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_fuse(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = fuse_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env("FUSE_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run fuse binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn path_arg(tmp: &TempDir, name: &str) -> String {
    tmp.path().join(name).to_string_lossy().into_owned()
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_fuse(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized"));

    let (_, stderr, ok) = run_fuse(&config, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_ingest_then_stats() {
    let (tmp, config) = setup_test_env();
    run_fuse(&config, &["init"]);

    let (stdout, stderr, ok) = run_fuse(&config, &["ingest", &path_arg(&tmp, "passages.jsonl")]);
    assert!(ok, "ingest failed: {}", stderr);
    assert!(stdout.contains("Ingested 3 passages"), "got: {}", stdout);
    assert!(stdout.contains("generation 1"), "got: {}", stdout);

    let (stdout, stderr, ok) = run_fuse(&config, &["stats"]);
    assert!(ok, "stats failed: {}", stderr);
    assert!(stdout.contains("Documents:    3"), "got: {}", stdout);
    assert!(stdout.contains("Generation:   1"), "got: {}", stdout);
}

#[test]
fn test_ingest_rejects_empty_text() {
    let (tmp, config) = setup_test_env();
    run_fuse(&config, &["init"]);
    fs::write(tmp.path().join("bad.jsonl"), r#"{"text": "  "}"#).unwrap();

    let (_, stderr, ok) = run_fuse(&config, &["ingest", &path_arg(&tmp, "bad.jsonl")]);
    assert!(!ok);
    assert!(stderr.contains("text must not be empty"), "got: {}", stderr);
}

#[test]
fn test_experiment_lifecycle() {
    let (tmp, config) = setup_test_env();
    run_fuse(&config, &["init"]);

    let (stdout, stderr, ok) = run_fuse(
        &config,
        &["experiment", "create", &path_arg(&tmp, "experiment.toml")],
    );
    assert!(ok, "create failed: {}", stderr);
    assert!(stdout.contains("Created experiment 'fusion-ab' with 2 variants (DRAFT)"));

    let (stdout, _, ok) = run_fuse(&config, &["experiment", "start", "fusion-ab"]);
    assert!(ok);
    assert!(stdout.contains("is RUNNING"));

    // starting twice is an invalid transition
    let (_, stderr, ok) = run_fuse(&config, &["experiment", "start", "fusion-ab"]);
    assert!(!ok);
    assert!(stderr.contains("cannot transition"), "got: {}", stderr);

    let (stdout, _, ok) = run_fuse(&config, &["experiment", "list"]);
    assert!(ok);
    assert!(stdout.contains("fusion-ab"));
    assert!(stdout.contains("RUNNING"));

    let (stdout, stderr, ok) = run_fuse(&config, &["experiment", "analyze", "fusion-ab", "--json"]);
    assert!(ok, "analyze failed: {}", stderr);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["experiment_id"], "fusion-ab");
    assert_eq!(report["control_variant"], "control");

    let (stdout, _, ok) = run_fuse(&config, &["experiment", "stop", "fusion-ab"]);
    assert!(ok);
    assert!(stdout.contains("is STOPPED"));
}

#[test]
fn test_experiment_weights_must_sum_to_one() {
    let (tmp, config) = setup_test_env();
    run_fuse(&config, &["init"]);
    fs::write(
        tmp.path().join("lopsided.toml"),
        r#"id = "lopsided"

[[variants]]
id = "a"
strategy = "weighted_average"
allocation_weight = 0.7

[[variants]]
id = "b"
strategy = "majority_vote"
allocation_weight = 0.7
"#,
    )
    .unwrap();

    let (_, stderr, ok) = run_fuse(
        &config,
        &["experiment", "create", &path_arg(&tmp, "lopsided.toml")],
    );
    assert!(!ok);
    assert!(stderr.contains("sum to"), "got: {}", stderr);
}

#[test]
fn test_feedback_and_learn() {
    let (_tmp, config) = setup_test_env();
    run_fuse(&config, &["init"]);

    let (_, stderr, ok) = run_fuse(
        &config,
        &["feedback", "--session", "s1", "--provider", "gpt", "--reward", "1.5"],
    );
    assert!(!ok);
    assert!(stderr.contains("--reward must be in [0.0, 1.0]"));

    let (stdout, stderr, ok) = run_fuse(
        &config,
        &["feedback", "--session", "s1", "--provider", "gpt", "--reward", "0.0"],
    );
    assert!(ok, "feedback failed: {}", stderr);
    assert!(stdout.contains("Recorded reward 0.00 for provider 'gpt'"));

    // weights replay from the persisted log on every start
    let (stdout, stderr, ok) = run_fuse(&config, &["learn"]);
    assert!(ok, "learn failed: {}", stderr);
    assert!(stdout.contains("gpt"), "got: {}", stdout);
    assert!(stdout.contains("0.9000"), "got: {}", stdout);
}

#[test]
fn test_eval_reports_quality() {
    let (tmp, config) = setup_test_env();
    run_fuse(&config, &["init"]);
    run_fuse(&config, &["ingest", &path_arg(&tmp, "passages.jsonl")]);
    fs::write(
        tmp.path().join("cases.jsonl"),
        r#"{"query": "Cargo builds Rust crates and resolves their dependencies.", "relevant": ["cargo.md"]}"#,
    )
    .unwrap();

    let (stdout, stderr, ok) = run_fuse(
        &config,
        &["eval", &path_arg(&tmp, "cases.jsonl"), "--k", "3"],
    );
    assert!(ok, "eval failed: {}", stderr);
    assert!(stdout.contains("over 1 queries (k = 3)"), "got: {}", stdout);
    assert!(stdout.contains("MRR:          1.0000"), "got: {}", stdout);
}

#[test]
fn test_ask_without_providers_fails() {
    let (_tmp, config) = setup_test_env();
    run_fuse(&config, &["init"]);

    let (_, stderr, ok) = run_fuse(&config, &["ask", "what does cargo do?"]);
    assert!(!ok);
    assert!(stderr.contains("No generation providers configured"), "got: {}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, ok) = run_fuse(&tmp.path().join("nope.toml"), &["stats"]);
    assert!(!ok);
    assert!(stderr.contains("Failed to read config file"), "got: {}", stderr);
}
