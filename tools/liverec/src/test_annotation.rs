//! Test-run annotations.
//!
//! A `TestAnnotation` correlates a sequence of annotations with one named
//! test run. Each call emits one annotation named after the test; the
//! lifecycle calls use fixed details so the replay side can find the start,
//! end, result and output of every test.

use crate::annotation::{AnnotationContent, AnnotationRequest, ContentType};
use crate::errors::RecorderError;
use std::collections::HashMap;

pub const DETAIL_TEST_START: &str = "u-test-start";
pub const DETAIL_TEST_END: &str = "u-test-end";
pub const DETAIL_TEST_RESULT: &str = "u-test-result";
pub const DETAIL_TEST_OUTPUT: &str = "u-test-output";

/// Outcome of a test. Values are shared with the replay side and must stay
/// numerically stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestResult {
    Unknown = 0,
    Success = 1,
    Failure = 2,
    Skipped = 3,
    Other = 4,
}

impl TestResult {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Result<Self, RecorderError> {
        match code {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Success),
            2 => Ok(Self::Failure),
            3 => Ok(Self::Skipped),
            4 => Ok(Self::Other),
            other => Err(RecorderError::InvalidArgument(format!(
                "unknown test result {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestAnnotation {
    test_name: String,
    started: bool,
    ended: bool,
}

impl TestAnnotation {
    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn ended(&self) -> bool {
        self.ended
    }

    pub(crate) fn start(&self) -> AnnotationRequest {
        self.emit(DETAIL_TEST_START, AnnotationContent::None)
    }

    pub(crate) fn end(&self) -> AnnotationRequest {
        self.emit(DETAIL_TEST_END, AnnotationContent::None)
    }

    pub(crate) fn mark_started(&mut self) {
        self.started = true;
    }

    pub(crate) fn mark_ended(&mut self) {
        self.ended = true;
    }

    pub(crate) fn result(&self, result: TestResult) -> AnnotationRequest {
        self.emit(
            DETAIL_TEST_RESULT,
            AnnotationContent::Int {
                value: result.code(),
            },
        )
    }

    pub(crate) fn output(
        &self,
        content_type: ContentType,
        output: &str,
    ) -> Result<AnnotationRequest, RecorderError> {
        Ok(self.emit(
            DETAIL_TEST_OUTPUT,
            AnnotationContent::text(content_type, Some(output))?,
        ))
    }

    /// Caller-chosen detail; required, since it is the only thing telling
    /// this test's annotations apart.
    pub(crate) fn custom(
        &self,
        detail: &str,
        content: AnnotationContent,
    ) -> Result<AnnotationRequest, RecorderError> {
        if detail.is_empty() {
            return Err(RecorderError::InvalidArgument(
                "test annotation detail must not be empty".to_string(),
            ));
        }
        Ok(self.emit(detail, content))
    }

    fn emit(&self, detail: &str, content: AnnotationContent) -> AnnotationRequest {
        AnnotationRequest::internal(&self.test_name, detail, content)
    }
}

/// Hands out test names, counting runs per base name for the suffix.
#[derive(Debug, Default)]
pub struct TestNamer {
    runs: HashMap<String, u64>,
}

impl TestNamer {
    pub fn create(
        &mut self,
        base_name: &str,
        add_run_suffix: bool,
    ) -> Result<TestAnnotation, RecorderError> {
        if base_name.is_empty() {
            return Err(RecorderError::InvalidArgument(
                "test name must not be empty".to_string(),
            ));
        }
        let test_name = if add_run_suffix {
            let run = self.runs.entry(base_name.to_string()).or_insert(0);
            *run += 1;
            format!("{base_name}-run-{run}")
        } else {
            base_name.to_string()
        };
        Ok(TestAnnotation {
            test_name,
            started: false,
            ended: false,
        })
    }
}
