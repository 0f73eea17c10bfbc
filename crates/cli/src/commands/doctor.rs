use nsmr_core::config::{AppConfig, LoadOptions};
use nsmr_core::domain::level::ApprovalLevel;
use nsmr_db::repositories::{ApproverRepository, SqlApproverRepository};
use nsmr_db::{connect_with_config, migrations, DbPool};
use serde::Serialize;

use crate::commands::CommandResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Fail { 1 } else { 0 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_bootstrap_admins(&config));
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["bootstrap_admins", "database_connectivity", "schema_migrations", "approver_staffing"] {
                checks.push(skipped(name));
            }
        }
    }

    let failed = checks.iter().any(|check| check.status == CheckStatus::Fail);
    let overall_status = if failed { CheckStatus::Fail } else { CheckStatus::Pass };
    let summary = if failed {
        "doctor: one or more readiness checks failed".to_string()
    } else {
        "doctor: all readiness checks passed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn skipped(name: &'static str) -> DoctorCheck {
    DoctorCheck {
        name,
        status: CheckStatus::Skipped,
        details: "skipped because a prerequisite check failed".to_string(),
    }
}

fn check_bootstrap_admins(config: &AppConfig) -> DoctorCheck {
    let admins = config.workflow.bootstrap_principals();
    if admins.is_empty() {
        DoctorCheck {
            name: "bootstrap_admins",
            status: CheckStatus::Warn,
            details: "no bootstrap admins configured; approver registry can only be managed by existing admins"
                .to_string(),
        }
    } else {
        DoctorCheck {
            name: "bootstrap_admins",
            status: CheckStatus::Pass,
            details: format!("{} bootstrap admin(s) configured", admins.len()),
        }
    }
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![
                DoctorCheck {
                    name: "database_connectivity",
                    status: CheckStatus::Fail,
                    details: format!("failed to initialize async runtime: {error}"),
                },
                skipped("schema_migrations"),
                skipped("approver_staffing"),
            ];
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck {
                        name: "database_connectivity",
                        status: CheckStatus::Fail,
                        details: format!("failed to connect to database: {error}"),
                    },
                    skipped("schema_migrations"),
                    skipped("approver_staffing"),
                ];
            }
        };

        let mut checks = vec![DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        }];

        let schema = check_schema(&pool).await;
        let schema_ready = schema.status == CheckStatus::Pass;
        checks.push(schema);
        checks.push(if schema_ready {
            check_staffing(&pool).await
        } else {
            skipped("approver_staffing")
        });

        pool.close().await;
        checks
    })
}

async fn check_schema(pool: &DbPool) -> DoctorCheck {
    let expected = migrations::embedded_count();
    match migrations::applied_count(pool).await {
        Ok(applied) if applied >= expected => DoctorCheck {
            name: "schema_migrations",
            status: CheckStatus::Pass,
            details: format!("{applied}/{expected} migrations applied"),
        },
        Ok(applied) => DoctorCheck {
            name: "schema_migrations",
            status: CheckStatus::Fail,
            details: format!("{applied}/{expected} migrations applied; run `nsmr migrate`"),
        },
        Err(error) => DoctorCheck {
            name: "schema_migrations",
            status: CheckStatus::Fail,
            details: format!("migration lookup failed: {error}"),
        },
    }
}

async fn check_staffing(pool: &DbPool) -> DoctorCheck {
    let approvers = SqlApproverRepository::new(pool.clone());
    let mut unstaffed = Vec::new();
    for level in ApprovalLevel::all() {
        match approvers.approvers_of(level).await {
            Ok(members) if members.is_empty() => unstaffed.push(level.value().to_string()),
            Ok(_) => {}
            Err(error) => {
                return DoctorCheck {
                    name: "approver_staffing",
                    status: CheckStatus::Fail,
                    details: format!("approver lookup failed: {error}"),
                };
            }
        }
    }

    if unstaffed.is_empty() {
        DoctorCheck {
            name: "approver_staffing",
            status: CheckStatus::Pass,
            details: "every approval level has at least one approver".to_string(),
        }
    } else {
        DoctorCheck {
            name: "approver_staffing",
            status: CheckStatus::Warn,
            details: format!("levels without approvers: {}", unstaffed.join(", ")),
        }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
