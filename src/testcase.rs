//! Test case aggregation and suite discovery
//!
//! A test case runs its scenarios in order and folds their properties
//! into one verdict. Properties of the same kind overwrite each other, so
//! the last scenario reporting a kind decides its value. The suite lists
//! test cases from the data directory and writes one JSON document per
//! test case.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::SuiteConfig;
use crate::error::ScenarioError;
use crate::property::{Property, PropertyKind, PropertyRecord, PropertyRegistry, Status};
use crate::scenario::{Scenario, ScenarioContext, ScenarioKind};

/// JSON body of one test case
#[derive(Debug, Serialize)]
pub struct TestCaseRecord {
    pub status: Status,
    pub properties: BTreeMap<&'static str, PropertyRecord>,
}

pub struct TestCase<'r> {
    name: String,
    registry: &'r PropertyRegistry,
    scenarios: Vec<Scenario>,
    properties: BTreeMap<PropertyKind, Property>,
}

impl<'r> TestCase<'r> {
    /// Create a test case running `scenarios`, or every scenario kind
    pub fn new(name: impl Into<String>, registry: &'r PropertyRegistry, scenarios: Option<&[ScenarioKind]>) -> Self {
        let name = name.into();
        let scenarios = ScenarioKind::ALL
            .into_iter()
            .filter(|kind| scenarios.map_or(true, |selected| selected.contains(kind)))
            .map(|kind| Scenario::new(kind, name.clone()))
            .collect();

        Self {
            name,
            registry,
            scenarios,
            properties: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.values()
    }

    pub fn property(&self, kind: PropertyKind) -> Option<&Property> {
        self.properties.get(&kind)
    }

    /// Store a property, replacing any earlier one of the same kind
    pub fn add_property(&mut self, property: Property) {
        self.properties.insert(property.kind, property);
    }

    /// Run every scenario, then record the summed error count
    pub fn run(&mut self, ctx: &ScenarioContext<'_>) -> Result<bool, ScenarioError> {
        let mut errors = 0;
        for index in 0..self.scenarios.len() {
            let properties = self.scenarios[index].run(ctx)?;
            errors += self.scenarios[index].errors().len();
            for property in properties {
                self.add_property(property);
            }
        }
        self.add_property(Property::errors(errors));

        let result = self.result();
        debug!("Test case {} result: {}", self.name, Status::from_result(result));
        Ok(result)
    }

    pub fn status(&self, property: &Property) -> Status {
        self.registry.status(property)
    }

    /// False iff some held property failed; informational ones never count
    pub fn result(&self) -> bool {
        self.properties
            .values()
            .all(|property| self.status(property) != Status::Fail)
    }

    pub fn record(&self) -> TestCaseRecord {
        TestCaseRecord {
            status: Status::from_result(self.result()),
            properties: self
                .properties
                .values()
                .map(|property| {
                    (
                        property.kind.name(),
                        PropertyRecord {
                            value: property.value,
                            status: self.status(property),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Document keyed by the test case name
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        let mut document = serde_json::Map::new();
        document.insert(self.name.clone(), serde_json::to_value(self.record())?);
        Ok(serde_json::Value::Object(document))
    }

    /// Write `test-client-server-<name>.json` into `outdir`
    pub fn save(&self, outdir: &Path) -> Result<PathBuf> {
        let path = outdir.join(format!("test-client-server-{}.json", self.name));
        let file = fs::File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = io::BufWriter::new(file);

        let formatter = PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut writer, formatter);
        self.to_json()
            .and_then(|document| document.serialize(&mut serializer))
            .with_context(|| format!("Failed to serialize {}", self.name))?;
        writeln!(writer)?;
        writer.flush()?;
        Ok(path)
    }
}

pub struct TestSuite<'r> {
    testcase_dir: PathBuf,
    testcases: Vec<TestCase<'r>>,
}

impl<'r> TestSuite<'r> {
    /// List the test-case directory, keeping only the selected names
    pub fn discover(
        config: &SuiteConfig,
        registry: &'r PropertyRegistry,
        testcases: Option<&[String]>,
        scenarios: Option<&[ScenarioKind]>,
    ) -> Result<Self> {
        let testcase_dir = config.testcase_dir();
        let mut names = fs::read_dir(&testcase_dir)
            .with_context(|| format!("Failed to list test cases in {}", testcase_dir.display()))?
            .map(|entry| entry.map(|entry| entry.file_name().to_string_lossy().into_owned()))
            .collect::<io::Result<Vec<_>>>()
            .with_context(|| format!("Failed to read {}", testcase_dir.display()))?;
        names.sort();

        if let Some(selected) = testcases {
            names.retain(|name| selected.contains(name));
        }

        let testcases = names
            .into_iter()
            .map(|name| TestCase::new(name, registry, scenarios))
            .collect();

        Ok(Self {
            testcase_dir,
            testcases,
        })
    }

    pub fn testcases(&self) -> &[TestCase<'r>] {
        &self.testcases
    }

    /// Union of every test case's `deps` file, sorted
    ///
    /// Test cases without a `deps` file contribute nothing.
    pub fn dependencies(&self) -> Result<Vec<String>> {
        let mut dependencies = BTreeSet::new();
        for testcase in &self.testcases {
            let path = self.testcase_dir.join(testcase.name()).join("deps");
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to read {}", path.display()))
                }
            };
            dependencies.extend(
                text.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string),
            );
        }
        Ok(dependencies.into_iter().collect())
    }

    /// Run every test case; true iff all of them passed
    pub fn run(&mut self, ctx: &ScenarioContext<'_>) -> Result<bool, ScenarioError> {
        for testcase in &mut self.testcases {
            testcase.run(ctx)?;
        }
        Ok(self.result())
    }

    pub fn result(&self) -> bool {
        self.testcases.iter().all(TestCase::result)
    }

    /// Write every test case's JSON document, creating `outdir` if needed
    pub fn save(&self, outdir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(outdir)
            .with_context(|| format!("Failed to create output directory {}", outdir.display()))?;
        self.testcases
            .iter()
            .map(|testcase| testcase.save(outdir))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::Value;
    use tempfile::TempDir;

    fn data_dir_with(testcases: &[(&str, Option<&str>)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("testcases").join("client-server");
        for (name, deps) in testcases {
            let testcase = root.join(name);
            fs::create_dir_all(&testcase).unwrap();
            if let Some(deps) = deps {
                fs::write(testcase.join("deps"), deps).unwrap();
            }
        }
        dir
    }

    fn config_for(dir: &TempDir) -> SuiteConfig {
        SuiteConfig {
            data_dir: dir.path().to_path_buf(),
            ..SuiteConfig::default()
        }
    }

    #[test]
    fn test_last_property_of_a_kind_wins() {
        let registry = PropertyRegistry::standard();
        let mut testcase = TestCase::new("getaddrinfo", &registry, None);
        testcase.add_property(Property::new(PropertyKind::Ip4Listener, false));
        testcase.add_property(Property::new(PropertyKind::Ip4Listener, true));

        assert_eq!(testcase.properties().count(), 1);
        assert_eq!(
            testcase.property(PropertyKind::Ip4Listener).map(|p| p.value),
            Some(Value::Bool(true))
        );
        assert!(testcase.result());
    }

    #[test]
    fn test_single_failure_fails_the_case() {
        let registry = PropertyRegistry::standard();
        let mut testcase = TestCase::new("getaddrinfo", &registry, None);
        testcase.add_property(Property::errors(0));
        testcase.add_property(Property::new(PropertyKind::ConnectionCleanup, false));
        testcase.add_property(Property::new(PropertyKind::Ip4Listener, true));
        assert!(testcase.result());

        testcase.add_property(Property::new(PropertyKind::Ip6Listener, false));
        assert!(!testcase.result());
    }

    #[test]
    fn test_scenario_filter() {
        let registry = PropertyRegistry::standard();
        let testcase = TestCase::new("getaddrinfo", &registry, Some(&[ScenarioKind::V6Dropped]));
        let names: Vec<&str> = testcase.scenarios().iter().map(Scenario::name).collect();
        assert_eq!(names, vec!["v6dropped"]);

        let testcase = TestCase::new("getaddrinfo", &registry, None);
        assert_eq!(testcase.scenarios().len(), 3);
    }

    #[test]
    fn test_json_document_shape() {
        let registry = PropertyRegistry::standard();
        let mut testcase = TestCase::new("netcat", &registry, None);
        testcase.add_property(Property::errors(1));
        testcase.add_property(Property::new(PropertyKind::V6PreferredDelay, None));

        let json = testcase.to_json().unwrap();
        assert_eq!(json["netcat"]["status"], "FAIL");
        assert_eq!(json["netcat"]["properties"]["errors"]["value"], 1);
        assert_eq!(json["netcat"]["properties"]["errors"]["status"], "FAIL");
        assert!(json["netcat"]["properties"]["ip6-preferred-delay"]["value"].is_null());
    }

    #[test]
    fn test_save_uses_four_space_indent() {
        let registry = PropertyRegistry::standard();
        let mut testcase = TestCase::new("netcat", &registry, None);
        testcase.add_property(Property::errors(0));

        let outdir = TempDir::new().unwrap();
        let path = testcase.save(outdir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), "test-client-server-netcat.json");

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("{\n    \"netcat\": {\n        \""));
        assert!(text.ends_with("}\n"));
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["netcat"]["status"], "PASS");
    }

    #[test]
    fn test_discover_sorts_and_filters() {
        let dir = data_dir_with(&[("wget", None), ("curl", None), ("netcat", None)]);
        let registry = PropertyRegistry::standard();
        let config = config_for(&dir);

        let suite = TestSuite::discover(&config, &registry, None, None).unwrap();
        let names: Vec<&str> = suite.testcases().iter().map(TestCase::name).collect();
        assert_eq!(names, vec!["curl", "netcat", "wget"]);

        let selected = vec!["wget".to_string(), "missing".to_string()];
        let suite = TestSuite::discover(&config, &registry, Some(&selected), None).unwrap();
        let names: Vec<&str> = suite.testcases().iter().map(TestCase::name).collect();
        assert_eq!(names, vec!["wget"]);
    }

    #[test]
    fn test_discover_missing_directory() {
        let dir = TempDir::new().unwrap();
        let registry = PropertyRegistry::standard();
        let err = TestSuite::discover(&config_for(&dir), &registry, None, None).err().unwrap();
        assert!(format!("{:#}", err).contains("Failed to list test cases"));
    }

    #[test]
    fn test_dependencies_union() {
        let dir = data_dir_with(&[
            ("curl", Some("curl\nglibc\n")),
            ("netcat", Some("nmap-ncat\n\nglibc\n")),
            ("wget", None),
        ]);
        let registry = PropertyRegistry::standard();
        let suite = TestSuite::discover(&config_for(&dir), &registry, None, None).unwrap();
        assert_eq!(suite.dependencies().unwrap(), vec!["curl", "glibc", "nmap-ncat"]);
    }

    #[test]
    fn test_suite_save_creates_outdir() {
        let dir = data_dir_with(&[("curl", None), ("wget", None)]);
        let registry = PropertyRegistry::standard();
        let suite = TestSuite::discover(&config_for(&dir), &registry, None, None).unwrap();

        let outdir = dir.path().join("json-output");
        let written = suite.save(&outdir).unwrap();
        assert_eq!(written.len(), 2);
        assert!(outdir.join("test-client-server-curl.json").exists());
        assert!(suite.result());
    }
}
