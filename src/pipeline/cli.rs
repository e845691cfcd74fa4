// In-band operator CLI. A user turn beginning with `proxy-cli` short-circuits
// the pipeline: the subcommand runs locally and the result comes back as a
// synthesized assistant message, with no upstream dispatch.

pub const CLI_PREFIX: &str = "proxy-cli";
pub const CLI_BACKEND_LABEL: &str = "proxy-cli";

/// Run a CLI line if the text is one. `None` means this is a normal request.
pub fn try_execute(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix(CLI_PREFIX)?;
    let mut parts = rest.split_whitespace();
    let command = parts.next().unwrap_or("help");

    let output = match command {
        "status" => status(),
        "models" => models(),
        "use" => match parts.next() {
            Some(backend) => use_backend(backend),
            None => "Usage: proxy-cli use <backend>".to_string(),
        },
        "smart" => toggle_smart(parts.next()),
        "logs" => logs(parts.next().and_then(|n| n.parse().ok()).unwrap_or(10)),
        _ => help(),
    };
    Some(output)
}

fn status() -> String {
    let stats = crate::observe::stats_snapshot();
    let backends = crate::config::backend_names();
    format!(
        "Gateway status\n\
         - Default backend: {}\n\
         - Smart routing: {}\n\
         - Configured backends: {}\n\
         - Requests served: {}\n\
         - Errors: {}\n\
         - Mean latency: {:.1} ms",
        crate::router::default_backend(),
        if crate::router::smart_routing_enabled() { "on" } else { "off" },
        backends.join(", "),
        stats.requests_total,
        stats.errors_total,
        stats.latency_avg_ms,
    )
}

fn models() -> String {
    let Some(config) = crate::config::get_config() else {
        return "No configuration loaded".to_string();
    };
    let mut lines = vec!["Configured backends:".to_string()];
    for backend in &config.backends {
        lines.push(format!(
            "- {} [{}] window={} speed={}{} specialties: {}",
            backend.name,
            backend.dialect,
            backend.context_window,
            backend.speed,
            if backend.premium { " premium" } else { "" },
            backend.specialties.join(", "),
        ));
    }
    lines.join("\n")
}

fn use_backend(name: &str) -> String {
    match crate::router::set_default_backend(name) {
        Ok(()) => format!("Default backend switched to {}", name),
        Err(e) => format!("Cannot switch: {}", e),
    }
}

fn toggle_smart(arg: Option<&str>) -> String {
    let target = match arg {
        Some("on") => true,
        Some("off") => false,
        _ => !crate::router::smart_routing_enabled(),
    };
    crate::router::set_smart_routing(target);
    format!("Smart routing {}", if target { "enabled" } else { "disabled" })
}

fn logs(limit: usize) -> String {
    let entries = crate::observe::recent(limit.min(100), None, None);
    if entries.is_empty() {
        return "No requests logged yet".to_string();
    }
    let mut lines = vec![format!("Last {} requests:", entries.len())];
    for entry in entries {
        lines.push(format!(
            "- {} {} -> {} [{}] {} ms{}",
            entry.timestamp.format("%H:%M:%S"),
            entry.id,
            entry.backend,
            entry.status,
            entry.duration_ms,
            entry
                .error
                .as_ref()
                .map(|e| format!(" error: {}", e))
                .unwrap_or_default(),
        ));
    }
    lines.join("\n")
}

fn help() -> String {
    "proxy-cli commands:\n\
     - status          gateway state and counters\n\
     - models          configured backends\n\
     - use <backend>   switch the default backend\n\
     - smart [on|off]  toggle smart routing\n\
     - logs [N]        recent requests\n\
     - help            this text"
        .to_string()
}
