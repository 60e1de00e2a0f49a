//! Models command implementation.

use super::types::ModelsCommand;
use crate::config::Settings;
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, Utc};
use colored::Colorize;
use serde_json::json;
use std::collections::BTreeMap;
use tessera_training::{CheckpointManifest, ModelLayout, ModelRegistry};

/// Execute the models command.
pub fn execute(command: ModelsCommand, settings: &Settings) -> Result<()> {
    let registry = ModelRegistry::new(ModelLayout::new(&settings.model_folder));
    match command {
        ModelsCommand::List { json } => list_models(&registry, json),
        ModelsCommand::Show { model_id, json } => show_model(&registry, &model_id, json),
    }
}

fn manifest(registry: &ModelRegistry, model_id: &str) -> Result<CheckpointManifest> {
    let path = registry.layout().manifest_path(model_id);
    CheckpointManifest::load_or_new(&path, model_id)
        .with_context(|| format!("Failed to read manifest: {}", path.display()))
}

fn format_metrics(metrics: &BTreeMap<String, f64>) -> String {
    metrics.iter().map(|(k, v)| format!("{k}={v:.4}")).collect::<Vec<_>>().join(" ")
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

fn list_models(registry: &ModelRegistry, json_output: bool) -> Result<()> {
    let ids = registry.list_models().context("Failed to list trained models")?;
    let mut rows = Vec::with_capacity(ids.len());
    for id in ids {
        let id = id.to_string();
        let manifest = manifest(registry, &id)?;
        rows.push((id, manifest));
    }

    if json_output {
        let out: Vec<_> = rows
            .iter()
            .map(|(id, manifest)| {
                json!({
                    "id": id,
                    "checkpoints": manifest.checkpoints.len(),
                    "latest": manifest.latest(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Trained Models ({})", rows.len()).bold().cyan());
    println!();

    if rows.is_empty() {
        println!("  {}", "No trained models found.".dimmed());
        println!();
        println!("  {}", "Tip: run `tessera train <config>` to train one.".dimmed());
        return Ok(());
    }

    println!("{:<8} {:<14} {:<18} {:<12} {}", "ID", "Latest", "Saved", "Checkpoints", "Metrics");
    println!("{}", "─".repeat(80));
    for (id, manifest) in &rows {
        let (tag, saved, metrics) = manifest.latest().map_or_else(
            || ("-".to_string(), "-".to_string(), String::new()),
            |e| (e.tag.clone(), format_time(&e.created_at), format_metrics(&e.metrics)),
        );
        println!(
            "{:<8} {:<14} {:<18} {:<12} {}",
            id.cyan(),
            tag,
            saved,
            manifest.checkpoints.len(),
            metrics.dimmed()
        );
    }
    println!();
    Ok(())
}

fn show_model(registry: &ModelRegistry, model_id: &str, json_output: bool) -> Result<()> {
    if !registry.model_exists(model_id) {
        bail!("Model '{}' not found in {}", model_id, registry.layout().root().display());
    }
    let config = registry.read_model_config(model_id).context("Failed to read model config")?;
    let manifest = manifest(registry, model_id)?;

    if json_output {
        let out = json!({
            "id": model_id,
            "config": serde_json::to_value(&config)?,
            "checkpoints": manifest.checkpoints,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Model {model_id}").bold().cyan());
    println!();
    println!("{}", "Config".bold());
    for line in config.to_yaml_string()?.lines() {
        println!("  {line}");
    }
    println!();
    println!("{}", format!("Checkpoints ({})", manifest.checkpoints.len()).bold());
    for entry in &manifest.checkpoints {
        println!(
            "  {:<14} {} {}",
            entry.tag.cyan(),
            format_time(&entry.created_at).dimmed(),
            format_metrics(&entry.metrics)
        );
    }
    println!();
    Ok(())
}
