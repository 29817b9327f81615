//! meow CLI Entry Point
//!
//! Provides a command-line interface for validating and baking workflow
//! templates.
//!
//! # Usage
//!
//! ```bash
//! # Bake a template file and print the compiled steps as JSON
//! meow release.meow.toml --var version=1.4.0
//!
//! # Bake a named workflow from a template found on the search path
//! meow release#hotfix --run-id hotfix-7
//!
//! # Validate only
//! meow release.meow.toml --validate-only
//!
//! # Quote substituted values in shell commands
//! meow deploy.meow.toml --shell-escape --output steps.json
//! ```

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::Utc;
use colored::Colorize;
use log::{error, info};

use meow::workflow::loader::{EmbeddedTemplates, TemplateLoader};
use meow::workflow::{load_document, validate_full_module, Module, ValidationResult};
use meow::{Baker, APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default, PartialEq)]
struct Config {
    template: Option<String>,
    variables: Vec<(String, String)>,
    run_id: Option<String>,
    assignee: Option<String>,
    project_dir: Option<PathBuf>,
    output: Option<PathBuf>,
    validate_only: bool,
    shell_escape: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };

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
///
/// Goes to stderr so baked JSON on stdout stays clean.
fn print_banner() {
    eprintln!();
    eprintln!("{} v{}", APP_NAME.bold(), VERSION);
    eprintln!("Workflow Template Compiler");
    eprintln!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: meow [OPTIONS] <TEMPLATE>");
    println!();
    println!("Arguments:");
    println!("  <TEMPLATE>           Template file, or name[#workflow] on the search path");
    println!();
    println!("Options:");
    println!("  --workflow TEMPLATE  Same as the positional <TEMPLATE>");
    println!("  --var KEY=VALUE      Bind a workflow variable (repeatable)");
    println!("  --run-id ID          Workflow instance ID (default: <name>-<timestamp>)");
    println!("  --assignee NAME      Default agent for agent steps");
    println!("  --project-dir PATH   Project root for template lookup (default: cwd)");
    println!("  --output PATH        Write baked steps to PATH instead of stdout");
    println!("  --validate-only      Validate without baking");
    println!("  --shell-escape       Quote substituted values in shell commands");
    println!("  --verbose            Enable debug logging");
    println!("  --help               Show this help message");
    println!("  --version            Show version information");
    println!();
    println!("Examples:");
    println!("  meow release.meow.toml --var version=1.4.0");
    println!("  meow release#hotfix --run-id hotfix-7");
}

/// Splits `KEY=VALUE`.
fn parse_binding(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("Invalid variable binding '{}' (expected KEY=VALUE)", raw)),
    }
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    let value = |i: usize, flag: &str| -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", flag))
    };

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
            "--validate-only" => config.validate_only = true,
            "--shell-escape" => config.shell_escape = true,
            "--verbose" | "-v" => config.verbose = true,
            "--var" => {
                i += 1;
                config.variables.push(parse_binding(&value(i, "--var")?)?);
            }
            "--workflow" | "-w" => {
                i += 1;
                if config.template.is_some() {
                    return Err("Template given more than once".to_string());
                }
                config.template = Some(value(i, "--workflow")?);
            }
            "--run-id" => {
                i += 1;
                config.run_id = Some(value(i, "--run-id")?);
            }
            "--assignee" => {
                i += 1;
                config.assignee = Some(value(i, "--assignee")?);
            }
            "--project-dir" => {
                i += 1;
                config.project_dir = Some(PathBuf::from(value(i, "--project-dir")?));
            }
            "--output" | "-o" => {
                i += 1;
                config.output = Some(PathBuf::from(value(i, "--output")?));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.template.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.template = Some(arg.clone());
            }
        }
        i += 1;
    }

    if config.template.is_none() {
        return Err("No template given".to_string());
    }
    Ok(config)
}

/// Loads the template as a file path, or by name through the search path.
///
/// Returns the module, its display name and the requested workflow.
fn load_template(
    template: &str,
    project_dir: &Path,
) -> Result<(Module, String, Option<String>), Box<dyn std::error::Error>> {
    let (target, workflow) = match template.split_once('#') {
        Some((target, workflow)) => (target, Some(workflow.to_string())),
        None => (template, None),
    };

    let loader = TemplateLoader::new(project_dir, EmbeddedTemplates::new());
    let path = Path::new(target);

    let (mut tree, name) = if path.is_file() {
        info!("Loading template file: {}", path.display());
        let module = load_document(path)?;
        let name = path
            .file_name()
            .map(|n| {
                n.to_string_lossy()
                    .trim_end_matches(".meow.toml")
                    .trim_end_matches(".toml")
                    .to_string()
            })
            .unwrap_or_else(|| target.to_string());
        // Referenced templates still come from the search path
        (loader.load_tree_from(&name, module, workflow.as_deref())?, name)
    } else {
        (loader.load_tree(template)?, target.to_string())
    };

    let module = tree
        .modules
        .remove(&tree.root)
        .ok_or_else(|| format!("Template '{}' did not load", target))?;
    Ok((module, name, workflow))
}

/// Prints a colored validation report to stderr.
fn report(result: &ValidationResult) {
    if result.is_valid() {
        eprintln!("{} template is valid", "✓".green());
        return;
    }
    eprintln!("{} {} validation error(s):", "✗".red(), result.len());
    for err in result.errors() {
        eprintln!("  {} {}", "-".red(), err);
    }
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let template = config.template.as_deref().unwrap_or_default();
    let project_dir = match &config.project_dir {
        Some(dir) => dir.clone(),
        None => env::current_dir()?,
    };

    let (module, name, selected) = load_template(template, &project_dir).map_err(|e| {
        error!("Failed to load template: {}", e);
        format!("Could not load template '{}': {}", template, e)
    })?;
    info!("Template loaded: {} workflow(s)", module.len());

    let result = validate_full_module(&module);
    report(&result);
    result.into_result()?;

    if config.validate_only {
        return Ok(());
    }

    let workflow = match &selected {
        Some(key) => module.get(key).ok_or_else(|| {
            format!(
                "Template '{}' has no workflow '{}' (available: {})",
                name,
                key,
                module.names().join(", ")
            )
        })?,
        None => module
            .entry()
            .ok_or_else(|| format!("Template '{}' has no entry workflow", name))?,
    };
    if workflow.internal && selected.is_some() {
        return Err(format!("Workflow '{}#{}' is internal", name, workflow.name).into());
    }

    let run_id = config
        .run_id
        .clone()
        .unwrap_or_else(|| format!("{}-{}", name, Utc::now().format("%Y%m%d%H%M%S")));
    let inputs: HashMap<String, String> = config.variables.iter().cloned().collect();

    let mut baker = Baker::new(run_id).with_shell_escaping(config.shell_escape);
    if let Some(assignee) = &config.assignee {
        baker = baker.with_default_assignee(assignee.clone());
    }
    let steps = baker.bake_workflow(workflow, &inputs)?;
    info!("Baked {} step(s) as '{}'", steps.len(), baker.workflow_id());

    let json = serde_json::to_string_pretty(&steps)?;
    match &config.output {
        Some(path) => {
            fs::write(path, json)?;
            eprintln!("{} wrote {} step(s) to {}", "✓".green(), steps.len(), path.display());
        }
        None => println!("{}", json),
    }

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
