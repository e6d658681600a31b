//! Output formatters for statistics lines and run reports.
//!
//! Supports pretty (one summary line per interval, table at the end) and
//! JSON output formats.

use super::OutputFmt;
use crate::coordinator::{GracefulStop, RunReport};
use crate::stats::StatsLine;

/// Format one periodic statistics line.
pub fn format_stats_line(line: &StatsLine, fmt: OutputFmt) -> String {
    match fmt {
        OutputFmt::Pretty => line.to_string(),
        OutputFmt::Json => serde_json::to_string(line)
            .unwrap_or_else(|e| format!("{{\"error\": \"serialization failed: {e}\"}}")),
    }
}

/// Format a finished run as a human-readable report.
pub fn format_pretty(report: &RunReport) -> String {
    let mut out = String::new();

    let version = env!("CARGO_PKG_VERSION");
    out.push_str(&format!("burstgen {version} run {}\n", report.run_id));
    out.push_str(&format!(
        "Mode: {} on {} ({} workers), started {}\n",
        report.mode,
        report.interfaces.join(","),
        report.workers.len(),
        report.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    let duration_s = report.duration_ms as f64 / 1000.0;
    out.push_str(&format!("Duration: {duration_s:.2}s"));
    if report.graceful_stop != GracefulStop::NotApplicable {
        out.push_str(&format!(", graceful stop: {}", graceful_str(report.graceful_stop)));
    }
    out.push_str("\n\n");

    out.push_str(&format!(
        "{:<8}{:<10}{:<6}{:<12}{:<10}{:<12}{:<10}{}\n",
        "WORKER", "ROLE", "CPU", "SENT", "DROPS", "RCV", "UDP", "REPLIES"
    ));
    for w in &report.workers {
        let cpu_label = match (w.cpu, w.pinned) {
            (Some(cpu), true) => cpu.to_string(),
            (Some(cpu), false) => format!("{cpu}*"),
            (None, _) => "-".to_string(),
        };
        out.push_str(&format!(
            "{:<8}{:<10}{:<6}{:<12}{:<10}{:<12}{:<10}{}\n",
            w.index,
            w.role,
            cpu_label,
            w.counters.sent,
            w.counters.send_drops,
            w.counters.received,
            w.counters.udp_received,
            w.counters.icmp_replies
        ));
    }
    out.push('\n');

    let t = &report.totals;
    out.push_str(&format!(
        "Totals: sent {}, drops {}, rcv {}, udp {}, echo replies {}\n",
        t.sent, t.send_drops, t.received, t.udp_received, t.icmp_replies
    ));

    let failures: u64 = report.workers.iter().map(|w| w.burst_failures).sum();
    let send_errors: u64 = report.workers.iter().map(|w| w.send_errors).sum();
    let rx_errors: u64 = report.workers.iter().map(|w| w.rx_errors).sum();
    if failures + send_errors + rx_errors > 0 {
        out.push_str(&format!(
            "Errors: {failures} abandoned bursts, {send_errors} send errors, {rx_errors} bad packets\n"
        ));
    }
    out.push_str(&format!(
        "Pool: {} of {} buffers in use, {} allocation failures\n",
        report.pool.in_use, report.pool.capacity, report.pool.failures
    ));

    out
}

/// Format a finished run as JSON.
pub fn format_json(report: &RunReport) -> String {
    serde_json::to_string_pretty(report)
        .unwrap_or_else(|e| format!("{{\"error\": \"serialization failed: {e}\"}}"))
}

fn graceful_str(g: GracefulStop) -> &'static str {
    match g {
        GracefulStop::NotApplicable => "n/a",
        GracefulStop::RepliesReceived => "all replies received",
        GracefulStop::TimedOut => "timed out",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunPlan;
    use crate::pktio::PoolStats;
    use crate::worker::{CounterSnapshot, WorkerReport};
    use crate::Mode;
    use chrono::Utc;
    use uuid::Uuid;

    fn make_report(graceful_stop: GracefulStop) -> RunReport {
        let counters = CounterSnapshot {
            sent: 5,
            icmp_replies: 0,
            ..Default::default()
        };
        RunReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration_ms: 3420,
            mode: Mode::Ping,
            interfaces: vec!["eth0".into()],
            plan: RunPlan {
                workers: 2,
                cpus: vec![0, 1],
                tx_burst: 1,
                rx_queues: 1,
                tx_queues: 1,
                pkt_count_max: Some(5),
                seq_step: 0,
            },
            workers: vec![
                WorkerReport {
                    index: 0,
                    role: "transmit",
                    cpu: Some(1),
                    pinned: true,
                    counters,
                    bursts: 5,
                    burst_failures: 0,
                    send_errors: 0,
                    rx_errors: 0,
                    poll_errors: 0,
                },
                WorkerReport {
                    index: 1,
                    role: "receive",
                    cpu: Some(0),
                    pinned: false,
                    counters: CounterSnapshot {
                        received: 5,
                        icmp_replies: 5,
                        ..Default::default()
                    },
                    bursts: 0,
                    burst_failures: 0,
                    send_errors: 0,
                    rx_errors: 0,
                    poll_errors: 0,
                },
            ],
            totals: CounterSnapshot {
                sent: 5,
                received: 5,
                icmp_replies: 5,
                ..Default::default()
            },
            graceful_stop,
            pool: PoolStats {
                capacity: 2048,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_stats_line_pretty_and_json() {
        let line = StatsLine {
            sent: 10,
            drops: 1,
            send_rate: 5,
            max_send_rate: 7,
            ..Default::default()
        };
        assert!(format_stats_line(&line, OutputFmt::Pretty)
            .starts_with("sent: 10, drops: 1, send rate: 5 pps"));

        let json = format_stats_line(&line, OutputFmt::Json);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["sent"], 10);
        assert_eq!(parsed["max_send_rate"], 7);
        assert!(!json.contains('\n'), "one JSON object per line");
    }

    #[test]
    fn test_format_pretty_header_and_table() {
        let output = format_pretty(&make_report(GracefulStop::RepliesReceived));
        assert!(output.contains("burstgen"));
        assert!(output.contains("Mode: ping on eth0 (2 workers)"));
        assert!(output.contains("Duration: 3.42s, graceful stop: all replies received"));
        assert!(output.contains("transmit"));
        assert!(output.contains("0*"), "unpinned worker CPU is starred");
        assert!(output.contains("Totals: sent 5, drops 0, rcv 5, udp 0, echo replies 5"));
        assert!(!output.contains("Errors:"), "no error line when nothing failed");
    }

    #[test]
    fn test_format_pretty_omits_graceful_stop_outside_ping() {
        let output = format_pretty(&make_report(GracefulStop::NotApplicable));
        assert!(!output.contains("graceful stop"));
    }

    #[test]
    fn test_format_json_structure() {
        let json = format_json(&make_report(GracefulStop::TimedOut));
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["mode"], "ping");
        assert_eq!(parsed["graceful_stop"], "timed-out");
        assert_eq!(parsed["duration_ms"], 3420);
        assert_eq!(parsed["workers"][1]["counters"]["icmp_replies"], 5);
        assert_eq!(parsed["plan"]["cpus"][1], 1);
        assert_eq!(parsed["pool"]["capacity"], 2048);
    }
}
