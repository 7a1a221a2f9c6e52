// Gateway metric names and the small helpers the agent calls on its hot
// paths. All instruments go through the `metrics` facade; the Prometheus
// recorder is installed in `observability`.
use rally_session::PropagateCtx;

pub const CONNECTED_CLIENTS: &str = "rally_connected_clients";
pub const SEND_QUEUE_SPARE: &str = "rally_agent_send_queue_spare";
pub const HANDLER_LATENCY_SECONDS: &str = "rally_handler_latency_seconds";
pub const WRITES_TOTAL: &str = "rally_agent_writes_total";
pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "rally_heartbeat_timeouts_total";

pub fn report_connected_clients(count: usize) {
    metrics::gauge!(CONNECTED_CLIENTS).set(count as f64);
}

pub fn report_send_queue_spare(spare: usize) {
    metrics::gauge!(SEND_QUEUE_SPARE).set(spare as f64);
}

pub fn report_write(result: &'static str) {
    metrics::counter!(WRITES_TOTAL, "result" => result).increment(1);
}

pub fn report_heartbeat_timeout() {
    metrics::counter!(HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
}

/// Handler latency for the request the context was built from. Contexts
/// without a start instant (heartbeats, detached pushes) are skipped.
pub fn report_timing_from_ctx(ctx: &PropagateCtx, err: Option<&dyn std::fmt::Display>) {
    let Some(started) = ctx.started() else {
        return;
    };
    let route = ctx.route().unwrap_or("unknown").to_string();
    let status = if err.is_some() { "error" } else { "ok" };
    metrics::histogram!(HANDLER_LATENCY_SECONDS, "route" => route, "status" => status)
        .record(started.elapsed().as_secs_f64());
}
