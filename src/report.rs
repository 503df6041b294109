//! Plain-text suite report

use std::fmt::{self, Write};

use crate::property::Status;
use crate::scenario::Scenario;
use crate::socket::Socket;
use crate::testcase::{TestCase, TestSuite};

fn write_socket(out: &mut String, label: &str, socket: &Socket, scenario: &Scenario) -> fmt::Result {
    writeln!(out, "      {}: {}", label, socket)?;
    for event in socket.events.iter().filter_map(|&id| scenario.event(id)) {
        writeln!(out, "        {}", event)?;
    }
    Ok(())
}

fn write_scenario(out: &mut String, scenario: &Scenario) -> fmt::Result {
    writeln!(out, "    {}", scenario)?;
    for listener in scenario.listeners() {
        write_socket(out, "Listener", listener, scenario)?;
    }
    for connection in scenario.connections() {
        write_socket(out, "Connection", connection, scenario)?;
    }
    for error in scenario.errors() {
        writeln!(out, "      {}", error)?;
    }
    Ok(())
}

/// Render one test case: scenarios, properties sorted by text, verdict
pub fn write_testcase(out: &mut String, testcase: &TestCase<'_>) -> fmt::Result {
    writeln!(out, "{}", testcase.name())?;
    writeln!(out, "  Scenarios:")?;
    for scenario in testcase.scenarios() {
        write_scenario(out, scenario)?;
    }

    writeln!(out, "  Properties:")?;
    let mut lines: Vec<(String, Status)> = testcase
        .properties()
        .map(|property| (property.describe(), testcase.status(property)))
        .collect();
    lines.sort_by(|a, b| a.0.cmp(&b.0));
    for (text, status) in lines {
        writeln!(out, "    {} ({})", text, status)?;
    }

    writeln!(out, "  Result: {}", Status::from_result(testcase.result()))?;
    writeln!(out)
}

pub fn render(suite: &TestSuite<'_>) -> String {
    let mut out = String::from("\n");
    for testcase in suite.testcases() {
        // Writing into a String cannot fail
        let _ = write_testcase(&mut out, testcase);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{Property, PropertyKind, PropertyRegistry};
    use crate::scenario::ScenarioKind;

    #[test]
    fn test_testcase_report_layout() {
        let registry = PropertyRegistry::standard();
        let mut testcase = TestCase::new("curl", &registry, Some(&[ScenarioKind::Loopback]));
        testcase.add_property(Property::errors(0));
        testcase.add_property(Property::new(PropertyKind::V6PreferredDelay, Some(0.25)));

        let mut out = String::new();
        write_testcase(&mut out, &testcase).unwrap();

        assert_eq!(
            out,
            "curl\n\
             \x20 Scenarios:\n\
             \x20   loopback\n\
             \x20 Properties:\n\
             \x20   IPv6 is preferred and fallback to IPv4 takes 0.250 seconds. (PASS)\n\
             \x20   Number of errors: 0 (PASS)\n\
             \x20 Result: PASS\n\n"
        );
    }

    #[test]
    fn test_failed_case_reports_fail() {
        let registry = PropertyRegistry::standard();
        let mut testcase = TestCase::new("wget", &registry, Some(&[]));
        testcase.add_property(Property::new(PropertyKind::Ip6Listener, false));
        testcase.add_property(Property::new(PropertyKind::ParallelConnect, false));

        let mut out = String::new();
        write_testcase(&mut out, &testcase).unwrap();
        assert!(out.contains("Listens on IPv6: no (FAIL)"));
        assert!(out.contains("This is a classic dual-stack"));
        assert!(out.contains("(INFO)"));
        assert!(out.ends_with("  Result: FAIL\n\n"));
    }
}
