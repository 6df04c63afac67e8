//! Cluster health and alert commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{Alert, ApiClient, ClusterHealthReport};
use crate::output::{
    color_percentage, color_status, format_timestamp, print_json, print_table, OutputFormat,
};

#[derive(Tabled)]
struct AlertRow {
    #[tabled(rename = "Time")]
    timestamp: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Component")]
    component: String,
    #[tabled(rename = "Message")]
    message: String,
}

fn alert_rows(alerts: &[Alert]) -> Vec<AlertRow> {
    alerts
        .iter()
        .map(|a| AlertRow {
            timestamp: format_timestamp(&a.timestamp),
            severity: color_status(&a.severity),
            component: a.component.clone(),
            message: a.message.clone(),
        })
        .collect()
}

/// Show the cluster health report
pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let report: ClusterHealthReport = client.get("api/v1/cluster/health").await?;

    if let OutputFormat::Json = format {
        print_json(&report);
        return Ok(());
    }

    println!("{}", "Cluster Health".bold());
    println!("{}", "=".repeat(50));
    println!("Status:          {}", color_status(&report.status).bold());
    println!(
        "Nodes:           {} ({} with free GPUs)",
        report.total_nodes, report.available_nodes
    );
    println!(
        "GPUs:            {} total, {} allocated, {} available",
        report.total_gpus, report.allocated_gpus, report.available_gpus
    );
    println!(
        "Utilization:     {}",
        color_percentage(report.utilization_percentage)
    );
    println!("Generated:       {}", format_timestamp(&report.generated_at));

    if !report.active_alerts.is_empty() {
        println!();
        println!("{}", "Active Alerts".bold());
        print_table(alert_rows(&report.active_alerts), &report.active_alerts, format);
    }

    Ok(())
}

/// Show the most recent alerts, newest first
pub async fn list_alerts(client: &ApiClient, limit: usize, format: OutputFormat) -> Result<()> {
    let alerts: Vec<Alert> = client.get(&format!("api/v1/alerts?limit={}", limit)).await?;
    print_table(alert_rows(&alerts), &alerts, format);
    Ok(())
}
