use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use booking_flow::abandonment::ActivitySignal;
use booking_flow::analytics::{FanOutDispatcher, TracingDispatcher, create_context};
use booking_flow::clock::SystemClock;
use booking_flow::config::FlowSettings;
use booking_flow::flow::{FormData, resolve_flow_by_name};
use booking_flow::mode::{ModeDecisionEngine, ModeOptions, StaticProbe};
use booking_flow::store::FileStore;
use booking_flow::submission::{BookingError, BookingResult, BookingSubmitter};
use booking_flow::{FlowController, FlowControllerDeps, FlowHooks};

/// Confirms every booking locally.
struct DemoSubmitter;

#[async_trait]
impl BookingSubmitter for DemoSubmitter {
    async fn submit(&self, form_data: &FormData) -> Result<BookingResult, BookingError> {
        Ok(BookingResult {
            provider: "demo".into(),
            service: form_data
                .get("service")
                .and_then(Value::as_str)
                .unwrap_or("general")
                .to_string(),
            event_id: format!("evt_{}", uuid::Uuid::new_v4().simple()),
            scheduled_at: Utc::now() + chrono::Duration::days(1),
            timezone: "UTC".into(),
            attendee_email: form_data
                .get("email")
                .and_then(Value::as_str)
                .map(String::from),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; BOOKING_LOG_DIR switches output to a daily file
    let _log_guard = match std::env::var("BOOKING_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "booking-flow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                )
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                )
                .with_target(false)
                .init();
            None
        }
    };

    let mut args = std::env::args().skip(1);
    let archetype = args.next().unwrap_or_else(|| "simple".to_string());
    let service = args.next();

    let settings = FlowSettings::from_env();
    settings.validate()?;

    let state_dir =
        std::env::var("BOOKING_STATE_DIR").unwrap_or_else(|_| "./data".to_string());
    let store = FileStore::open(&state_dir)
        .with_context(|| format!("failed to open state directory {state_dir}"))?;

    eprintln!("📅 Booking Flow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Archetype: {}", archetype);
    eprintln!("   Service: {}", service.as_deref().unwrap_or("(none)"));
    eprintln!("   State dir: {}", state_dir);
    eprintln!("   Idle timeout: {}s\n", settings.idle_timeout.as_secs());

    let config = resolve_flow_by_name(&archetype, service.as_deref());
    let dispatcher = FanOutDispatcher::new().with_backend("log", Arc::new(TracingDispatcher));
    let deps = FlowControllerDeps {
        clock: Arc::new(SystemClock),
        store: Arc::new(store),
        submitter: Arc::new(DemoSubmitter),
        dispatcher: Some(Arc::new(dispatcher)),
        context: create_context(service.as_deref(), None, Some("cli"), None, None),
        settings,
        hooks: FlowHooks {
            on_success: Some(Arc::new(|result: &BookingResult| {
                eprintln!("   ✅ Booked {} ({})", result.service, result.event_id);
            })),
            on_error: Some(Arc::new(|err: &BookingError| {
                eprintln!("   ❌ Booking failed: {}", err);
            })),
            on_abandon: None,
        },
    };

    let controller = match FlowController::restore(config.clone(), deps.clone())? {
        Some(restored) => {
            eprintln!("   Resuming saved session");
            restored
        }
        None => FlowController::new(config, deps)?,
    };

    let decision = controller.choose_mode(
        &ModeDecisionEngine::new(),
        &ModeOptions::from_probe(&StaticProbe::default(), true, true),
    );
    eprintln!("   Presentation: {} ({})\n", decision.mode, decision.reason);

    controller.start().await?;

    let mut fields = FormData::new();
    fields.insert("name".into(), Value::from("Demo User"));
    fields.insert("email".into(), Value::from("demo@example.com"));
    if let Some(service) = &service {
        fields.insert("service".into(), Value::from(service.as_str()));
    }
    controller.update_form_data(fields).await?;

    // Walk every step to the end
    loop {
        controller.record_activity(ActivitySignal::Pointer).await;
        let state = controller.state().await;
        if let Some(step) = state.current_step() {
            eprintln!(
                "   [{:>3}%] {} ({}s left)",
                state.completion_percentage,
                step.label,
                state.time_remaining()
            );
        }
        let before = state.current_step_index;
        let after = controller.complete_current_step().await?;
        if after == before {
            break;
        }
    }

    match controller.submit_booking(FormData::new()).await {
        Ok(result) => eprintln!("   Scheduled at {}", result.scheduled_at),
        Err(e) => eprintln!("   Submission error: {}", e),
    }
    eprintln!(
        "   Phase: {}, elapsed {}s",
        controller.phase().await,
        controller.elapsed_seconds().await
    );

    controller.dispose().await;
    Ok(())
}
