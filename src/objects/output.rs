//! Plugin output splitting: short output, long output, performance data.

/// The three sections of a plugin's output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginOutput {
    pub short_output: String,
    pub long_output: String,
    pub perf_data: String,
}

/// Split raw plugin output.
///
/// The first line is `short output | perfdata`. Following lines are long
/// output until one contains `|`; everything after that bar (and on the
/// remaining lines) is more perfdata. Escaped `\n` sequences from result
/// files are treated as line breaks.
#[must_use]
pub fn parse_check_output(raw: &str) -> PluginOutput {
    let unescaped = raw.replace("\\n", "\n");
    let mut lines = unescaped.lines();
    let mut out = PluginOutput::default();

    let Some(first) = lines.next() else {
        return out;
    };
    let mut perf: Vec<String> = Vec::new();
    match first.split_once('|') {
        Some((short, data)) => {
            out.short_output = short.trim().to_string();
            push_perf(&mut perf, data);
        }
        None => out.short_output = first.trim().to_string(),
    }

    let mut long: Vec<&str> = Vec::new();
    let mut in_perf = false;
    for line in lines {
        if in_perf {
            push_perf(&mut perf, line);
            continue;
        }
        match line.split_once('|') {
            Some((text, data)) => {
                if !text.trim().is_empty() {
                    long.push(text.trim_end());
                }
                push_perf(&mut perf, data);
                in_perf = true;
            }
            None => long.push(line),
        }
    }

    out.long_output = long.join("\n");
    out.perf_data = perf.join(" ");
    out
}

fn push_perf(perf: &mut Vec<String>, data: &str) {
    let data = data.trim();
    if !data.is_empty() {
        perf.push(data.to_string());
    }
}
