//! `calcctl` – command-line caller for the calculation engine client.
//!
//! Runs calculations against an engine host, answering engine prompts from
//! flags or the terminal, and writes structured results for automation.

mod config;
mod console;
mod logging;

use anyhow::Context;
use calc_engine::batch::{load_batch, run_batch, BatchReport};
use calc_engine::traits::{DocumentFormat, DocumentSpec, FilesystemOps};
use calc_engine::types::*;
use calc_engine::{ClientContext, Credentials, EngineError};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::Instrument;

use crate::config::{AppConfig, OnErrorPolicy, PublicConfig};
use crate::console::{parse_answer, ConsoleUi};

// ===========================================================================
// CLI definition
// ===========================================================================

#[derive(Parser)]
#[command(
    name = "calcctl",
    version,
    about = "Run calculations against an external calculation engine"
)]
struct Cli {
    /// Directory holding global_config.yaml.
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum SaveFormat {
    Native,
    Pdf,
}

impl From<SaveFormat> for DocumentFormat {
    fn from(format: SaveFormat) -> Self {
        match format {
            SaveFormat::Native => DocumentFormat::Native,
            SaveFormat::Pdf => DocumentFormat::Pdf,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Calculate one calc item.
    Calc {
        /// Library reference, e.g. "$(SysLbrDir)\Steel.lib".
        library: String,
        /// Calc item name. Semicolons are escaped automatically.
        item: String,
        /// Seed variables XML file.
        #[arg(long)]
        input: Option<PathBuf>,
        /// Show the engine's own UI while calculating.
        #[arg(long)]
        show_ui: bool,
        /// Produce rendered output (RTF + PDF).
        #[arg(long)]
        render: bool,
        /// Event subscriptions (progress, undefined-variable, error). Defaults to config.
        #[arg(long, value_delimiter = ',')]
        events: Vec<EventKind>,
        /// Pre-answer an undefined-variable prompt.
        #[arg(long = "answer", value_name = "NAME=VALUE", value_parser = parse_answer)]
        answers: Vec<(String, String)>,
        /// Decision for expression errors. Defaults to config.
        #[arg(long, value_enum)]
        on_error: Option<OnErrorPolicy>,
        /// Write output variables XML here.
        #[arg(long)]
        save_vars: Option<PathBuf>,
        /// Write rendered RTF here (implies --render).
        #[arg(long)]
        save_rtf: Option<PathBuf>,
        /// Write rendered PDF here (implies --render).
        #[arg(long)]
        save_pdf: Option<PathBuf>,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
        /// Directory for artifacts output.
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },

    /// Run a sequence of calculations from a YAML file.
    RunBatch {
        /// Path to the batch YAML file.
        file: PathBuf,
        /// Event subscriptions. Defaults to config.
        #[arg(long, value_delimiter = ',')]
        events: Vec<EventKind>,
        #[arg(long = "answer", value_name = "NAME=VALUE", value_parser = parse_answer)]
        answers: Vec<(String, String)>,
        #[arg(long, value_enum)]
        on_error: Option<OnErrorPolicy>,
        /// Directory for artifacts output.
        #[arg(long)]
        artifacts: Option<PathBuf>,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Assemble a document from saved calculation output.
    SaveDocument {
        library: String,
        item: String,
        /// Output variables XML file.
        #[arg(long)]
        variables: PathBuf,
        /// Rendered RTF file.
        #[arg(long)]
        rendered: Option<PathBuf>,
        /// Document path to write.
        #[arg(long)]
        out: PathBuf,
        #[arg(long, value_enum, default_value = "native")]
        format: SaveFormat,
        /// Document name; defaults to the item name.
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration with secrets removed.
    Config,
}

// ===========================================================================
// Main
// ===========================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {:#}", e);
        std::process::exit(2);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = config::load_config(cli.config_dir.as_deref())
        .context("failed to load configuration")?;
    logging::init_logging(&config.logging, &config.secrets());

    match cli.command {
        Commands::Calc {
            library,
            item,
            input,
            show_ui,
            render,
            events,
            answers,
            on_error,
            save_vars,
            save_rtf,
            save_pdf,
            json,
            artifacts,
        } => {
            let ctx = build_context(&config)?;
            let run_id = new_run_id();
            let span = tracing::info_span!("run", run_id = %run_id, command = "calc");
            let opts = CalcOptions {
                input,
                show_ui: show_ui || config.calculation.show_ui,
                render: render
                    || save_rtf.is_some()
                    || save_pdf.is_some()
                    || config.calculation.render,
                events: event_set(&events, &config),
                save_vars,
                save_rtf,
                save_pdf,
            };
            let mut ui = ConsoleUi::new(answers, on_error.unwrap_or(config.calculation.on_error));
            let report = cmd_calc(&ctx, &run_id, &library, &item, opts, &mut ui)
                .instrument(span)
                .await;
            if let Some(ref dir) = artifacts {
                let art_dir = dir.join(&report.run_id);
                if let Err(e) = write_artifacts(ctx.fs(), &art_dir, &report) {
                    tracing::error!(dir = %art_dir.display(), error = %e, "failed to write artifacts");
                }
            }
            output_result(&report, json);
        }
        Commands::RunBatch {
            file,
            events,
            answers,
            on_error,
            artifacts,
            json,
        } => {
            let ctx = build_context(&config)?;
            let mut ui = ConsoleUi::new(answers, on_error.unwrap_or(config.calculation.on_error));
            cmd_run_batch(&ctx, &file, event_set(&events, &config), &mut ui, artifacts, json).await;
        }
        Commands::SaveDocument {
            library,
            item,
            variables,
            rendered,
            out,
            format,
            name,
            json,
        } => {
            let ctx = build_context(&config)?;
            let inputs = DocumentInputs {
                library,
                item,
                variables,
                rendered,
                name,
            };
            let report = cmd_save_document(&ctx, inputs, &out, format.into());
            output_result(&report, json);
        }
        Commands::Config => {
            let public = PublicConfig::from(&config);
            println!("{}", serde_json::to_string_pretty(&public)?);
        }
    }
    Ok(())
}

fn build_context(config: &AppConfig) -> anyhow::Result<ClientContext> {
    let engine = config
        .engine
        .endpoint()
        .context("no engine host configured: set engine.program or engine.socket")?;
    let authoring = config
        .authoring
        .host
        .endpoint()
        .map(|endpoint| (endpoint, config.authoring.visible));
    let mut ctx = ClientContext::from_endpoints(engine, authoring);

    if let Some(path) = &config.template {
        let template = read_text(ctx.fs(), path)
            .with_context(|| format!("cannot read template {}", path.display()))?;
        ctx = ctx.with_template(template);
    }
    let credentials = Credentials::new(
        config.license_user().unwrap_or_default(),
        config.license_password().unwrap_or_default(),
    );
    if !credentials.is_empty() {
        ctx = ctx.with_credentials(credentials);
    }
    Ok(ctx)
}

fn event_set(flags: &[EventKind], config: &AppConfig) -> EventSet {
    if flags.is_empty() {
        config.calculation.events
    } else {
        EventSet::from_kinds(flags.iter().copied())
    }
}

// ===========================================================================
// Subcommand implementations
// ===========================================================================

struct CalcOptions {
    input: Option<PathBuf>,
    show_ui: bool,
    render: bool,
    events: EventSet,
    save_vars: Option<PathBuf>,
    save_rtf: Option<PathBuf>,
    save_pdf: Option<PathBuf>,
}

async fn cmd_calc(
    ctx: &ClientContext,
    run_id: &str,
    library: &str,
    item: &str,
    opts: CalcOptions,
    ui: &mut ConsoleUi,
) -> RunReport {
    let start = Instant::now();
    let elapsed = |start: Instant| start.elapsed().as_millis() as u64;

    let mut request = CalculationRequest::new(library, item)
        .with_engine_ui(opts.show_ui)
        .with_rendered_output(opts.render)
        .with_events(opts.events);

    if let Some(path) = &opts.input {
        match read_input(ctx.fs(), path) {
            Ok(xml) => request = request.with_input_variables(xml),
            Err(e) => return report_err("calc", item, run_id, elapsed(start), &e),
        }
    }

    let dispatcher = ctx.dispatcher();
    let result = match dispatcher.dispatch(request, ui).await {
        Ok(result) => result,
        Err(e) => return report_err("calc", item, run_id, elapsed(start), &e),
    };

    let mut report = report_calculation("calc", item, run_id, elapsed(start), &result);

    // Save failures stay local to the save; the result above is final.
    let materializer = ctx.materializer();
    let mut saves = Vec::new();
    if let (Some(path), Some(xml)) = (opts.save_vars, &result.output_variables) {
        let outcome = materializer.save_variables(&path, xml);
        saves.push((path, outcome));
    }
    if let (Some(path), Some(text)) = (opts.save_rtf, &result.rendered_text) {
        let outcome = materializer.save_rendered(&path, &RenderedOutput::Text(text.clone()));
        saves.push((path, outcome));
    }
    if let (Some(path), Some(bytes)) = (opts.save_pdf, &result.rendered_binary) {
        let outcome = materializer.save_rendered(&path, &RenderedOutput::Binary(bytes.clone()));
        saves.push((path, outcome));
    }

    let mut save_errors = Vec::new();
    for (path, outcome) in saves {
        match outcome {
            Ok(()) => report.artifacts.push(path.display().to_string()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "saving output failed");
                save_errors.push(format!("{}: {}", path.display(), e));
            }
        }
    }
    if !save_errors.is_empty() {
        if let Some(serde_json::Value::Object(data)) = report.data.as_mut() {
            data.insert("save_errors".into(), serde_json::json!(save_errors));
        }
    }
    report
}

/// Seed variables from a file; a missing file is rejected before any engine work.
fn read_input(fs: &dyn FilesystemOps, path: &Path) -> Result<String, EngineError> {
    if !fs.exists(path) {
        return Err(EngineError::InvalidRequest(format!(
            "input variables file not found: {}",
            path.display()
        )));
    }
    read_text(fs, path)
}

fn read_text(fs: &dyn FilesystemOps, path: &Path) -> Result<String, EngineError> {
    String::from_utf8(fs.read_file(path)?).map_err(|e| {
        EngineError::InvalidRequest(format!("{} is not UTF-8 text: {}", path.display(), e))
    })
}

async fn cmd_run_batch(
    ctx: &ClientContext,
    file: &Path,
    events: EventSet,
    ui: &mut ConsoleUi,
    artifacts: Option<PathBuf>,
    json: bool,
) {
    let target = file.display().to_string();
    let yaml = match read_text(ctx.fs(), file) {
        Ok(s) => s,
        Err(e) => {
            let r = report_err("run-batch", &target, &new_run_id(), 0, &e);
            output_result(&r, json);
            return;
        }
    };
    let batch = match load_batch(&yaml) {
        Ok(b) => b,
        Err(e) => {
            let r = report_err("run-batch", &target, &new_run_id(), 0, &e);
            output_result(&r, json);
            return;
        }
    };

    let run_id = new_run_id();
    let art_dir = artifacts.map(|dir| dir.join(&run_id));
    let base_dir = file.parent().unwrap_or_else(|| Path::new("."));
    let dispatcher = ctx.dispatcher();
    let span = tracing::info_span!("run", run_id = %run_id, command = "run-batch");
    let report = run_batch(
        &batch,
        ctx,
        &dispatcher,
        events,
        ui,
        base_dir,
        art_dir.as_deref(),
    )
    .instrument(span)
    .await;

    if let Some(ref dir) = art_dir {
        if let Err(e) = write_batch_artifacts(ctx.fs(), dir, &report) {
            tracing::error!(dir = %dir.display(), error = %e, "failed to write batch artifacts");
        }
    }
    output_batch(&report, json);
}

struct DocumentInputs {
    library: String,
    item: String,
    variables: PathBuf,
    rendered: Option<PathBuf>,
    name: Option<String>,
}

fn cmd_save_document(
    ctx: &ClientContext,
    inputs: DocumentInputs,
    out: &Path,
    format: DocumentFormat,
) -> RunReport {
    let start = Instant::now();
    let run_id = new_run_id();
    let target = out.display().to_string();

    let outcome = document_spec(ctx.fs(), inputs)
        .and_then(|spec| ctx.materializer().save_document(format, &spec, out));
    let total = start.elapsed().as_millis() as u64;
    match outcome {
        Ok(()) => {
            let mut report = report_ok("save-document", &target, &run_id, total);
            report.artifacts.push(target);
            report
        }
        Err(e) => report_err("save-document", &target, &run_id, total, &e),
    }
}

fn document_spec(fs: &dyn FilesystemOps, inputs: DocumentInputs) -> Result<DocumentSpec, EngineError> {
    let variables_xml = read_text(fs, &inputs.variables)?;
    let rendered_text = match &inputs.rendered {
        Some(path) => read_text(fs, path)?,
        None => String::new(),
    };
    Ok(DocumentSpec {
        name: inputs.name.unwrap_or_else(|| inputs.item.clone()),
        library_ref: inputs.library,
        item_ref: inputs.item,
        variables_xml,
        rendered_text,
    })
}

// ===========================================================================
// Output helpers
// ===========================================================================

fn output_result(result: &RunReport, json: bool) {
    if json {
        let j = serde_json::to_string_pretty(result).unwrap_or_default();
        println!("{}", j);
    } else {
        print_human(result);
    }
    exit_for(result.status);
}

fn output_batch(report: &BatchReport, json: bool) {
    if json {
        let j = serde_json::to_string_pretty(report).unwrap_or_default();
        println!("{}", j);
    } else {
        println!("Batch: {}", report.name.as_deref().unwrap_or("<unnamed>"));
        println!("Overall: {}", status_label(report.overall_status));
        for step in &report.steps {
            let calc = step
                .calc_status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".into());
            println!(
                "  Step {}: {} -> {} (calc {}, expected {}, {}ms)",
                step.index + 1,
                step.name,
                status_label(step.status),
                calc,
                step.expected,
                step.timing_ms.total
            );
            if let Some(ref err) = step.error {
                println!("    error: {} – {}", err.code, err.message);
            }
        }
    }
    exit_for(report.overall_status);
}

fn exit_for(status: Status) {
    match status {
        Status::Pass => {}
        Status::Fail => std::process::exit(1),
        Status::Error => std::process::exit(2),
    }
}

fn status_label(status: Status) -> &'static str {
    match status {
        Status::Pass => "PASS",
        Status::Fail => "FAIL",
        Status::Error => "ERROR",
    }
}

fn print_human(r: &RunReport) {
    println!("[{}] {} {}", status_label(r.status), r.command, r.target);
    println!("  run_id: {}", r.run_id);
    if let Some(calc) = r.calc_status {
        println!("  calc:   {}", calc);
    }
    println!("  timing: {}ms", r.timing_ms.total);
    let mut steps: Vec<_> = r.timing_ms.steps.iter().collect();
    steps.sort();
    for (step, ms) in steps {
        println!("    {}: {}ms", step, ms);
    }
    if let Some(ref err) = r.error {
        println!("  error:  {} – {}", err.code, err.message);
    }
    for artifact in &r.artifacts {
        println!("  wrote:  {}", artifact);
    }
}

// ===========================================================================
// Artifact helpers
// ===========================================================================

fn write_artifacts(fs: &dyn FilesystemOps, art_dir: &Path, result: &RunReport) -> Result<(), EngineError> {
    let j = serde_json::to_string_pretty(result).unwrap_or_default();
    fs.write_file(&art_dir.join("result.json"), j.as_bytes())
}

fn write_batch_artifacts(
    fs: &dyn FilesystemOps,
    art_dir: &Path,
    report: &BatchReport,
) -> Result<(), EngineError> {
    let j = serde_json::to_string_pretty(report).unwrap_or_default();
    fs.write_file(&art_dir.join("result.json"), j.as_bytes())?;

    // One line per step
    let mut lines = String::new();
    for step in &report.steps {
        if let Ok(line) = serde_json::to_string(step) {
            lines.push_str(&line);
            lines.push('\n');
        }
    }
    fs.write_file(&art_dir.join("events.jsonl"), lines.as_bytes())
}
