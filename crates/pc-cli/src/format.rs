//! Output rendering for the three `--format` modes. No table-drawing crate
//! is pulled in here; `table` mode is a hand-rolled column layout, matching
//! how small CLI surfaces in this codebase print without extra dependencies.

use clap::ValueEnum;
use pc_wire::{
    EvaluateResultsResponse, EvaluateStatusResponse, RankedArtifact, RateLimitStatusResponse,
    RunDocumentResponse, RunListResponse, RunResponse,
};

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    Plain,
}

fn pad(col: &str, width: usize) -> String {
    format!("{col:<width$}")
}

fn print_rows(headers: &[&str], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }
    let header_line: String = headers
        .iter()
        .enumerate()
        .map(|(i, h)| pad(h, widths[i]))
        .collect::<Vec<_>>()
        .join("  ");
    println!("{header_line}");
    println!("{}", "-".repeat(header_line.len()));
    for row in rows {
        let line: String = row
            .iter()
            .enumerate()
            .map(|(i, c)| pad(c, widths[i]))
            .collect::<Vec<_>>()
            .join("  ");
        println!("{line}");
    }
}

pub fn print_run(format: OutputFormat, run: &RunResponse) {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(run).unwrap()),
        OutputFormat::Table | OutputFormat::Plain => {
            print_rows(
                &["run_id", "project_id", "title", "status", "priority"],
                &[vec![
                    run.run_id.clone(),
                    run.project_id.clone(),
                    run.title.clone().unwrap_or_default(),
                    run.status.clone(),
                    run.priority.to_string(),
                ]],
            );
        }
    }
}

pub fn print_run_list(format: OutputFormat, list: &RunListResponse) {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(list).unwrap()),
        OutputFormat::Table | OutputFormat::Plain => {
            let rows = list
                .runs
                .iter()
                .map(|r| {
                    vec![
                        r.run_id.clone(),
                        r.project_id.clone(),
                        r.title.clone().unwrap_or_default(),
                        r.status.clone(),
                        r.priority.to_string(),
                    ]
                })
                .collect::<Vec<_>>();
            print_rows(&["run_id", "project_id", "title", "status", "priority"], &rows);
            println!("\n{} of {} runs", list.runs.len(), list.total);
        }
    }
}

pub fn print_documents(format: OutputFormat, docs: &[RunDocumentResponse]) {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(docs).unwrap()),
        OutputFormat::Table | OutputFormat::Plain => {
            let rows = docs
                .iter()
                .map(|d| {
                    vec![
                        d.document_id.clone(),
                        d.display_name.clone(),
                        d.status.clone(),
                        d.sort_order.to_string(),
                        d.error_message.clone().unwrap_or_default(),
                    ]
                })
                .collect::<Vec<_>>();
            print_rows(&["document_id", "display_name", "status", "sort_order", "error"], &rows);
        }
    }
}

pub fn print_evaluate_status(format: OutputFormat, status: &EvaluateStatusResponse) {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(status).unwrap()),
        OutputFormat::Table | OutputFormat::Plain => {
            println!("run_id:                  {}", status.run_id);
            println!("phase:                   {}", status.phase);
            println!(
                "single-doc rows:         {}/{}",
                status.single_doc_rows_completed, status.single_doc_rows_total
            );
            println!(
                "pairwise results:        {}/{}",
                status.pairwise_results_completed, status.pairwise_results_total
            );
        }
    }
}

fn ranked_artifact_row(r: &RankedArtifact) -> Vec<String> {
    vec![
        r.artifact_id.clone(),
        r.document_id.clone().unwrap_or_default(),
        r.model_id.clone(),
        format!("{:.1}", r.elo_rating),
        r.games_played.to_string(),
        r.mean_single_doc_score
            .map(|s| format!("{s:.2}"))
            .unwrap_or_default(),
    ]
}

pub fn print_evaluate_results(format: OutputFormat, results: &EvaluateResultsResponse) {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(results).unwrap()),
        OutputFormat::Table | OutputFormat::Plain => {
            let rows = results.rankings.iter().map(ranked_artifact_row).collect::<Vec<_>>();
            print_rows(
                &["artifact_id", "document_id", "model_id", "elo", "games", "mean_score"],
                &rows,
            );
        }
    }
}

pub fn print_rate_limit_status(format: OutputFormat, status: &RateLimitStatusResponse) {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(status).unwrap()),
        OutputFormat::Table | OutputFormat::Plain => {
            let rows = status
                .buckets
                .iter()
                .map(|b| {
                    vec![
                        b.provider.clone(),
                        b.model.clone(),
                        format!("{}/{}", b.rpm_remaining, b.rpm_limit),
                        format!("{}/{}", b.tpm_remaining, b.tpm_limit),
                        b.window_reset_at.to_rfc3339(),
                    ]
                })
                .collect::<Vec<_>>();
            print_rows(&["provider", "model", "rpm", "tpm", "window_reset_at"], &rows);
        }
    }
}

pub fn print_json<T: serde::Serialize>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap());
}
