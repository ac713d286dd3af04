//! Extraction of test reports and coverage from a finished test action

use crate::client::ContentStore;
use crate::error::{RemoteError, Result};
use crate::mapper::{TEST_COVERAGE_FILE, TEST_RESULTS_FILE};
use crate::materialize::expand_tree;
use crate::merkle::Digest;
use crate::reapi;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

static ROOT_ELEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*(?:<\?xml.*?\?>\s*)?(?:<!--.*?-->\s*)*<(testsuites|testsuite|testcase)[\s/>]")
        .unwrap_or_else(|e| unreachable!("invalid root element pattern: {e}"))
});
static TESTCASE: LazyLock<Regex> = LazyLock::new(|| element("testcase"));
static FAILURE: LazyLock<Regex> = LazyLock::new(|| element("failure"));
static ERROR: LazyLock<Regex> = LazyLock::new(|| element("error"));
static SKIPPED: LazyLock<Regex> = LazyLock::new(|| element("skipped"));

fn element(name: &str) -> Regex {
    Regex::new(&format!(r"<{name}[\s/>]"))
        .unwrap_or_else(|e| unreachable!("invalid element pattern: {e}"))
}

/// Counts taken from one test report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestSummary {
    /// `testcase` elements
    pub cases: usize,
    /// `failure` elements
    pub failures: usize,
    /// `error` elements
    pub errors: usize,
    /// `skipped` elements
    pub skipped: usize,
}

impl TestSummary {
    /// Whether no case failed or errored
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures == 0 && self.errors == 0
    }
}

/// One test report blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    /// The raw report
    pub xml: String,
    /// What it contains
    pub summary: TestSummary,
}

impl TestReport {
    /// Validate and summarise a report
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let xml = String::from_utf8(data)
            .map_err(|e| RemoteError::test_result_parse(format!("report is not UTF-8: {e}")))?;
        let Some(root) = ROOT_ELEMENT.captures(&xml) else {
            return Err(RemoteError::test_result_parse(
                "report root element must be testsuites, testsuite or testcase",
            ));
        };
        debug!(root = &root[1], "Parsed test report");
        let summary = TestSummary {
            cases: TESTCASE.find_iter(&xml).count(),
            failures: FAILURE.find_iter(&xml).count(),
            errors: ERROR.find_iter(&xml).count(),
            skipped: SKIPPED.find_iter(&xml).count(),
        };
        Ok(Self { xml, summary })
    }
}

/// What a test run left behind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestArtifacts {
    /// Reports, in path order when the results were a directory
    pub results: Vec<TestReport>,
    /// Coverage profile; empty unless requested and produced
    pub coverage: String,
}

/// Pull reports and coverage out of a test action's result
pub async fn extract(
    store: &dyn ContentStore,
    label: &str,
    result: &reapi::ActionResult,
    coverage: bool,
) -> Result<TestArtifacts> {
    let blobs = result_blobs(store, result).await?;
    if blobs.is_empty() && result.exit_code == 0 {
        return Err(RemoteError::missing_test_results(label));
    }
    let results = blobs
        .into_iter()
        .map(TestReport::parse)
        .collect::<Result<Vec<_>>>()?;

    let coverage = if coverage {
        read_coverage(store, label, result).await?
    } else {
        String::new()
    };
    Ok(TestArtifacts { results, coverage })
}

async fn result_blobs(store: &dyn ContentStore, result: &reapi::ActionResult) -> Result<Vec<Vec<u8>>> {
    if let Some(file) = result.output_files.iter().find(|f| f.path == TEST_RESULTS_FILE) {
        return Ok(vec![file_content(store, file).await?]);
    }
    let Some(dir) = result
        .output_directories
        .iter()
        .find(|d| d.path == TEST_RESULTS_FILE)
    else {
        return Ok(Vec::new());
    };
    let tree = Digest::require(dir.tree_digest.as_ref(), TEST_RESULTS_FILE)?;
    let mut blobs = Vec::new();
    for (path, entry) in expand_tree(store, &tree).await? {
        debug!(file = %path, "Reading test results");
        blobs.push(store.read_blob(&entry.digest).await?);
    }
    Ok(blobs)
}

async fn read_coverage(store: &dyn ContentStore, label: &str, result: &reapi::ActionResult) -> Result<String> {
    let Some(file) = result.output_files.iter().find(|f| f.path == TEST_COVERAGE_FILE) else {
        warn!(label, "Coverage was requested but the test produced none");
        return Ok(String::new());
    };
    let data = file_content(store, file).await?;
    String::from_utf8(data)
        .map_err(|e| RemoteError::test_result_parse(format!("coverage is not UTF-8: {e}")))
}

async fn file_content(store: &dyn ContentStore, file: &reapi::OutputFile) -> Result<Vec<u8>> {
    let digest = Digest::require(file.digest.as_ref(), &file.path)?;
    if !file.contents.is_empty() || digest.size_bytes == 0 {
        return Ok(file.contents.clone());
    }
    store.read_blob(&digest).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryContentStore;
    use crate::merkle::DirectoryBuilder;
    use prost::Message;

    const RESULTS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>
<testcase name="//src/remote:remote_test">
  <test name="testResults" success="true" time="172" type="SUCCESS"/>
</testcase>
"#;

    const SUITE: &str = r#"<?xml version="1.0"?>
<testsuite tests="3">
  <testcase name="a"/>
  <testcase name="b"><failure message="boom"/></testcase>
  <testcase name="c"><skipped/></testcase>
</testsuite>
"#;

    fn output(store: &MemoryContentStore, path: &str, data: &[u8]) -> reapi::OutputFile {
        reapi::OutputFile {
            path: path.to_string(),
            digest: Some(store.insert(data.to_vec()).to_proto()),
            is_executable: false,
            contents: Vec::new(),
        }
    }

    #[test]
    fn test_parse_summarises_suite() {
        let report = TestReport::parse(SUITE.as_bytes().to_vec()).unwrap();
        assert_eq!(
            report.summary,
            TestSummary {
                cases: 3,
                failures: 1,
                errors: 0,
                skipped: 1,
            }
        );
        assert!(!report.summary.passed());
    }

    #[test]
    fn test_parse_rejects_other_documents() {
        let err = TestReport::parse(b"<html><body/></html>".to_vec()).unwrap_err();
        assert!(matches!(err, RemoteError::TestResultParse { .. }));
        assert!(TestReport::parse(vec![0xff, 0xfe]).is_err());
    }

    #[tokio::test]
    async fn test_coverage_only_when_requested() {
        let store = MemoryContentStore::new();
        let result = reapi::ActionResult {
            output_files: vec![
                output(&store, TEST_RESULTS_FILE, RESULTS.as_bytes()),
                output(&store, TEST_COVERAGE_FILE, b"mode: set\n"),
            ],
            ..Default::default()
        };

        let plain = extract(&store, "//package:t", &result, false).await.unwrap();
        assert_eq!(plain.results.len(), 1);
        assert_eq!(plain.results[0].xml, RESULTS);
        assert!(plain.coverage.is_empty());

        let covered = extract(&store, "//package:t", &result, true).await.unwrap();
        assert_eq!(covered.coverage, "mode: set\n");
    }

    #[tokio::test]
    async fn test_results_directory() {
        let store = MemoryContentStore::new();
        let mut builder = DirectoryBuilder::new();
        builder.add_file("b.xml", store.insert(SUITE.as_bytes().to_vec()), false).unwrap();
        builder.add_file("a.xml", store.insert(RESULTS.as_bytes().to_vec()), false).unwrap();
        let built = builder.build();
        let root = reapi::Directory::decode(built.directories[0].1.as_slice()).unwrap();
        let tree = store.insert_message(&reapi::Tree {
            root: Some(root),
            children: Vec::new(),
        });
        let result = reapi::ActionResult {
            output_directories: vec![reapi::OutputDirectory {
                path: TEST_RESULTS_FILE.to_string(),
                tree_digest: Some(tree.to_proto()),
                is_topologically_sorted: false,
            }],
            ..Default::default()
        };

        let artifacts = extract(&store, "//package:t", &result, false).await.unwrap();
        assert_eq!(artifacts.results.len(), 2);
        assert_eq!(artifacts.results[0].xml, RESULTS);
        assert_eq!(artifacts.results[1].summary.cases, 3);
    }

    #[tokio::test]
    async fn test_missing_results() {
        let store = MemoryContentStore::new();
        let passed = reapi::ActionResult::default();
        let err = extract(&store, "//package:t", &passed, false).await.unwrap_err();
        assert!(matches!(err, RemoteError::MissingTestResults { .. }));

        let failed = reapi::ActionResult {
            exit_code: 1,
            ..Default::default()
        };
        let artifacts = extract(&store, "//package:t", &failed, false).await.unwrap();
        assert!(artifacts.results.is_empty());
    }
}
