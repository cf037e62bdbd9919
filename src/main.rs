//! MapRunner CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow with an empty input document
//! maprunner pipeline.yaml
//!
//! # Provide the initial input from a file or inline
//! maprunner pipeline.yaml --input input.json
//! maprunner pipeline.yaml --input-json '{"bucket": "sources"}'
//!
//! # Check a workflow without running it
//! maprunner pipeline.yaml --validate
//!
//! # Bound map steps without their own ceiling and keep run records
//! maprunner pipeline.yaml --max-concurrency 8 --record-dir .maprunner/runs
//! ```

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info};
use serde_json::Value;

use maprunner::execution::record::DEFAULT_RECORD_DIR;
use maprunner::execution::{CommandInvoker, Engine, InvokerRegistry, RunRecordStore, DEFAULT_CONCURRENCY};
use maprunner::workflow::parser::load_workflow;
use maprunner::{RunResult, APP_NAME, VERSION};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workflow_path: String,
    input_path: Option<PathBuf>,
    input_json: Option<String>,
    run_id: Option<String>,
    max_concurrency: Option<usize>,
    record_dir: Option<PathBuf>,
    validate_only: bool,
    show_timeline: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflow_path: DEFAULT_WORKFLOW.to_string(),
            input_path: None,
            input_json: None,
            run_id: None,
            max_concurrency: None,
            record_dir: None,
            validate_only: false,
            show_timeline: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Fan-Out/Fan-In Workflow Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: maprunner [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>        Path to workflow YAML file");
    println!();
    println!("Options:");
    println!("  --input FILE           Read the initial input document from a JSON file");
    println!("  --input-json JSON      Use an inline JSON initial input document");
    println!("  --run-id ID            Run identifier (overrides the input's run_id)");
    println!(
        "  --max-concurrency N    Ceiling for map steps without one (default: {})",
        *DEFAULT_CONCURRENCY
    );
    println!(
        "  --record-dir DIR       Persist run records (e.g. {})",
        DEFAULT_RECORD_DIR
    );
    println!("  --validate             Load and validate the workflow, then exit");
    println!("  --timeline             Print an execution timeline after the run");
    println!("  --verbose              Enable debug logging");
    println!("  --help                 Show this help message");
    println!("  --version              Show version information");
    println!();
    println!("Examples:");
    println!("  maprunner pipeline.yaml --input input.json");
    println!("  maprunner pipeline.yaml --validate");
    println!("  maprunner pipeline.yaml --max-concurrency 8 --timeline");
}

/// Returns the value following an option, advancing the cursor.
fn option_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", option))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--validate" => {
                config.validate_only = true;
            }
            "--timeline" => {
                config.show_timeline = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--input" => {
                config.input_path = Some(PathBuf::from(option_value(args, &mut i, "--input")?));
            }
            "--input-json" => {
                config.input_json = Some(option_value(args, &mut i, "--input-json")?.to_string());
            }
            "--run-id" => {
                config.run_id = Some(option_value(args, &mut i, "--run-id")?.to_string());
            }
            "--max-concurrency" => {
                let raw = option_value(args, &mut i, "--max-concurrency")?;
                let ceiling: usize = raw
                    .parse()
                    .map_err(|_| format!("Invalid max-concurrency value: {}", raw))?;
                if ceiling == 0 {
                    return Err("--max-concurrency must be at least 1".to_string());
                }
                config.max_concurrency = Some(ceiling);
            }
            "--record-dir" => {
                config.record_dir = Some(PathBuf::from(option_value(args, &mut i, "--record-dir")?));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => config.workflow_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    if config.input_path.is_some() && config.input_json.is_some() {
        return Err("--input and --input-json cannot be combined".to_string());
    }

    Ok(config)
}

/// Builds the initial input document from the configured sources.
fn read_input(config: &Config) -> Result<Value, Box<dyn std::error::Error>> {
    let mut input = match (&config.input_path, &config.input_json) {
        (Some(path), _) => {
            let content = fs::read_to_string(path)
                .map_err(|e| format!("Could not read input '{}': {}", path.display(), e))?;
            serde_json::from_str(&content)
                .map_err(|e| format!("Input '{}' is not valid JSON: {}", path.display(), e))?
        }
        (None, Some(inline)) => {
            serde_json::from_str(inline).map_err(|e| format!("--input-json is not valid JSON: {}", e))?
        }
        (None, None) => Value::Object(serde_json::Map::new()),
    };

    if let Some(run_id) = &config.run_id {
        match &mut input {
            Value::Object(fields) => {
                fields.insert("run_id".to_string(), Value::String(run_id.clone()));
            }
            _ => return Err("--run-id requires the input document to be a JSON object".into()),
        }
    }

    Ok(input)
}

/// Prints the outcome of a run.
fn print_summary(result: &RunResult) {
    println!();
    match &result.failure {
        None => println!("{} run '{}'", "Succeeded".green().bold(), result.run_id),
        Some(failure) => {
            println!("{} run '{}'", "Failed".red().bold(), result.run_id);
            println!("  Step:  {}", failure.step);
            println!("  Kind:  {}", failure.kind);
            println!("  Cause: {}", failure.cause);
        }
    }

    let elapsed = result.elapsed().to_std().unwrap_or_default();
    println!("Total execution time: {:.2?}", elapsed);
    println!();
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    // Load workflow
    info!("Loading workflow: {}", config.workflow_path);
    let document = load_workflow(&config.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!(
            "Could not load workflow from '{}': {}",
            config.workflow_path, e
        )
    })?;

    info!(
        "Workflow loaded: {} steps, {} resources, map depth {}",
        document.graph.len(),
        document.graph.resources().len(),
        document.graph.map_depth()
    );

    let unbound = document.unbound_resources();
    if !unbound.is_empty() {
        return Err(format!("No command bound for resources: {}", unbound.join(", ")).into());
    }

    if config.validate_only {
        println!("{} {}", "Valid:".green().bold(), config.workflow_path);
        return Ok(true);
    }

    let input = read_input(&config)?;

    // Route every resource to its bound command
    let mut invokers = InvokerRegistry::new();
    for (resource, binding) in &document.resources {
        invokers.register(resource.clone(), Arc::new(CommandInvoker::new(binding.clone())));
    }

    // Create and configure engine
    let mut engine = Engine::new(document.graph, Arc::new(invokers))?;

    if let Some(ceiling) = config.max_concurrency {
        engine.set_default_concurrency(ceiling);
    }

    if let Some(dir) = config.record_dir {
        info!("Run records: {}", dir.display());
        engine.set_record_store(RunRecordStore::new(dir));
    }

    // Execute workflow
    let runtime = tokio::runtime::Runtime::new()?;
    let (result, timeline) = runtime.block_on(engine.run_with_timeline(input));

    print_summary(&result);
    if config.show_timeline {
        println!("{}", timeline.gantt_chart());
    }

    Ok(result.succeeded())
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("maprunner")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_default_arguments() {
        let config = parse_arguments(&args(&[])).unwrap();
        assert_eq!(config.workflow_path, DEFAULT_WORKFLOW);
        assert!(config.max_concurrency.is_none());
        assert!(!config.validate_only);
    }

    #[test]
    fn test_parse_all_options() {
        let config = parse_arguments(&args(&[
            "pipeline.yaml",
            "--input-json",
            "{\"bucket\":\"src\"}",
            "--run-id",
            "nightly",
            "--max-concurrency",
            "8",
            "--record-dir",
            "runs",
            "--timeline",
            "--verbose",
        ]))
        .unwrap();

        assert_eq!(config.workflow_path, "pipeline.yaml");
        assert_eq!(config.run_id.as_deref(), Some("nightly"));
        assert_eq!(config.max_concurrency, Some(8));
        assert_eq!(config.record_dir, Some(PathBuf::from("runs")));
        assert!(config.show_timeline);
        assert!(config.verbose);
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(parse_arguments(&args(&["--max-concurrency", "many"])).is_err());
        assert!(parse_arguments(&args(&["--max-concurrency", "0"])).is_err());
        assert!(parse_arguments(&args(&["--input"])).is_err());
        assert!(parse_arguments(&args(&["--bogus"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "b.yaml"])).is_err());
        assert!(parse_arguments(&args(&["--input", "a.json", "--input-json", "{}"])).is_err());
    }

    #[test]
    fn test_read_input_with_run_id_override() {
        let config = parse_arguments(&args(&["--input-json", "{\"run_id\":\"old\",\"n\":1}", "--run-id", "new"]))
            .unwrap();
        let input = read_input(&config).unwrap();
        assert_eq!(input, serde_json::json!({ "run_id": "new", "n": 1 }));
    }

    #[test]
    fn test_read_input_from_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("input.json");
        fs::write(&path, "{\"repositories\": []}").unwrap();

        let config = Config {
            input_path: Some(path),
            ..Config::default()
        };
        assert_eq!(read_input(&config).unwrap(), serde_json::json!({ "repositories": [] }));
    }

    #[test]
    fn test_read_input_defaults_to_empty_object() {
        assert_eq!(read_input(&Config::default()).unwrap(), serde_json::json!({}));
    }
}
