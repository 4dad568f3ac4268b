use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use coupon_service::{
    config,
    db,
    models::Coupon,
    services::{parse_amount, CouponDiscount, ReconciliationReport},
    AppState,
};
use serde::Serialize;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config().context("failed to load application config")?;
    config::init_tracing(config.log_level(), config.log_json);

    let state = AppState::build(config)
        .await
        .context("failed to initialise coupon store")?;
    handle_command(&state, cli.command, cli.json).await
}

#[derive(Parser)]
#[command(
    name = "coupon-admin",
    about = "Inspect, validate and reconcile coupons",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Preview the discount a coupon gives, without recording a use
    Validate(ValidateArgs),
    /// Show a coupon and its cached counters
    Show(CodeArgs),
    /// Recompute one coupon's counters from order history
    Reconcile(CodeArgs),
    /// Recompute the counters of every coupon
    ReconcileAll,
    /// Apply pending database migrations
    Migrate,
}

#[derive(Args)]
struct ValidateArgs {
    #[arg(long, help = "Coupon code, any case")]
    code: String,
    #[arg(long, help = "Order subtotal")]
    amount: String,
    #[arg(long, help = "Customer email")]
    email: Option<String>,
}

#[derive(Args)]
struct CodeArgs {
    #[arg(help = "Coupon code, any case")]
    code: String,
}

async fn handle_command(state: &AppState, command: Commands, json: bool) -> Result<()> {
    let service = state.coupon_service();
    match command {
        Commands::Validate(args) => {
            let amount = parse_amount(&args.amount)?;
            let discount = service
                .validate_coupon(&args.code, amount, args.email.as_deref())
                .await
                .with_context(|| format!("coupon {} is not valid", args.code))?;
            if json {
                print_json(&discount)?;
            } else {
                render_discount(&discount);
            }
        }
        Commands::Show(args) => {
            let coupon = service.get_coupon(&args.code).await?;
            if json {
                print_json(&coupon)?;
            } else {
                render_coupon(&coupon);
            }
        }
        Commands::Reconcile(args) => {
            let report = service
                .reconcile_usage_counts(&args.code)
                .await
                .with_context(|| format!("failed to reconcile coupon {}", args.code))?;
            if json {
                print_json(&report)?;
            } else {
                render_report(&report);
            }
        }
        Commands::ReconcileAll => {
            let reports = service.reconcile_all().await?;
            if json {
                print_json(&reports)?;
            } else {
                for report in &reports {
                    render_report(report);
                }
                let changed = reports.iter().filter(|r| r.changed()).count();
                println!("{} coupon(s) reconciled, {} changed", reports.len(), changed);
            }
        }
        Commands::Migrate => match &state.db {
            Some(pool) => {
                db::run_migrations(pool).await?;
                println!("Migrations applied");
            }
            None => println!("In-memory store configured; nothing to migrate"),
        },
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_discount(discount: &CouponDiscount) {
    println!(
        "Coupon {} is valid • discount {} • global usage {}",
        discount.coupon.code, discount.discount_amount, discount.global_usage
    );
    if let Some(usage) = discount.customer_usage {
        println!("  customer usage {}", usage);
    }
}

fn render_coupon(coupon: &Coupon) {
    println!(
        "- Coupon {} • {} {} • {} • used {}{}",
        coupon.code,
        coupon.discount_type.as_ref(),
        coupon.discount_value,
        if coupon.active { "active" } else { "inactive" },
        coupon.usage_count,
        coupon
            .global_limit()
            .map(|limit| format!("/{}", limit))
            .unwrap_or_default()
    );
    if let Some(expires_at) = coupon.expires_at {
        println!("  expires {}", expires_at.to_rfc3339());
    }
    if let Some(limit) = coupon.per_user_limit() {
        println!("  per customer limit {}", limit);
    }
    for (customer, count) in &coupon.user_usages {
        println!("  {} used {}", customer, count);
    }
}

fn render_report(report: &ReconciliationReport) {
    if report.changed() {
        println!(
            "- Coupon {} • usage {} -> {} • {} customer entr(ies)",
            report.code,
            report.previous_usage_count,
            report.usage_count,
            report.user_usages.len()
        );
    } else {
        println!("- Coupon {} • usage {} (unchanged)", report.code, report.usage_count);
    }
}
