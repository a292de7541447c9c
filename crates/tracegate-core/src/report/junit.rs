use std::path::Path;

use crate::error::{Result, TraceGateError};
use crate::report::{ExecutionReport, RunReport};

/// File name of the report, written into the result folder.
pub const JUNIT_FILE: &str = "junit.xml";

pub fn write_junit(report: &RunReport, out: &Path) -> Result<()> {
    std::fs::write(out, render(report)).map_err(|e| TraceGateError::io(out, e))
}

pub fn render(report: &RunReport) -> String {
    let run_id = report.run_id();
    let mut xml = String::new();
    xml.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    xml.push('\n');
    xml.push_str(&format!(
        r#"<testsuites id="{}" name="{}" tests="{}" failures="{}" time="{}">"#,
        escape(&run_id),
        escape(&format!(
            "Trace run for the job {} on {}",
            report.run_name, report.gpu_codename
        )),
        report.tests(),
        report.failures(),
        seconds(report.total_time_secs()),
    ));
    xml.push('\n');

    for exec in &report.executions {
        push_suite(&mut xml, &run_id, &report.gpu_codename, exec);
    }

    xml.push_str("</testsuites>\n");
    xml
}

fn push_suite(xml: &mut String, run_id: &str, codename: &str, exec: &ExecutionReport) {
    let suite_id = format!("{}-{}", run_id, exec.trace_filename);
    let filename = &exec.trace_filename;

    xml.push_str(&format!(
        "\t<testsuite id=\"{}\" name=\"{}\" tests=\"{}\" failures=\"{}\" time=\"{}\">\n",
        escape(&suite_id),
        escape(&format!("{} on {}", filename, codename)),
        1 + exec.frames.len(),
        exec.failures(),
        seconds(exec.runtime_secs),
    ));

    xml.push_str(&format!(
        "\t\t<testcase id=\"{}\" name=\"{}\" time=\"{}\">",
        escape(&format!("{}-execution", suite_id)),
        escape(&format!("{}'s overall execution", filename)),
        seconds(exec.runtime_secs),
    ));
    if exec.had_successful_execution {
        xml.push_str("</testcase>\n");
    } else {
        xml.push('\n');
        let mut system_out = exec.log.clone().unwrap_or_default();
        if !exec.problems.is_empty() {
            if !system_out.is_empty() && !system_out.ends_with('\n') {
                system_out.push('\n');
            }
            system_out.push_str("Malformed execution data:\n");
            for problem in &exec.problems {
                system_out.push_str(&format!(" - {}\n", problem));
            }
        }
        push_system_out(xml, &system_out);
        if exec.expected_to_work {
            let message = exec.failure_message.as_deref().unwrap_or("ERROR");
            push_failure(xml, message);
        }
        xml.push_str("\t\t</testcase>\n");
    }

    for frame in &exec.frames {
        xml.push_str(&format!(
            "\t\t<testcase id=\"{}\" name=\"{}\" time=\"0\">\n",
            escape(&format!("{}-{}", suite_id, frame.frame_id)),
            escape(&format!("{}'s frame {}", filename, frame.frame_id)),
        ));

        let mut system_out = String::new();
        if let Some(path) = &frame.path {
            system_out.push_str(&format!("[[ATTACHMENT|{}]]\n", path.display()));
        }
        if frame.is_acceptable() {
            system_out.push('\n');
            system_out.push_str(&frame.reason);
        } else {
            push_failure(xml, &format!("ERROR: {}", frame.reason));
        }
        push_system_out(xml, &system_out);
        xml.push_str("\t\t</testcase>\n");
    }

    xml.push_str("\t</testsuite>\n");
}

fn push_failure(xml: &mut String, message: &str) {
    xml.push_str(&format!(
        "\t\t\t<failure message=\"{}\" type=\"ERROR\" />\n",
        escape(message)
    ));
}

fn push_system_out(xml: &mut String, text: &str) {
    if text.is_empty() {
        xml.push_str("\t\t\t<system-out />\n");
    } else {
        xml.push_str(&format!("\t\t\t<system-out>{}</system-out>\n", escape(text)));
    }
}

fn seconds(secs: f64) -> String {
    format!("{:.3}", secs)
}

/// Drop characters XML 1.0 cannot carry at all.
fn strip_control_characters(s: &str) -> String {
    s.chars()
        .filter(|&c| match c {
            '\t' | '\n' | '\r' => true,
            '\u{0}'..='\u{1f}' | '\u{7f}' | '\u{fffe}' | '\u{ffff}' => false,
            _ => true,
        })
        .collect()
}

fn escape(s: &str) -> String {
    strip_control_characters(s)
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
