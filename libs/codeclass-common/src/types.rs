use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub type UserId = i64;
pub type ChallengeId = i64;

/// Languages a submission may declare.
///
/// This is the allow-list: nothing outside it is ever handed to an interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    #[serde(alias = "js", alias = "node")]
    JavaScript,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Python, Language::JavaScript];

    /// Parse a declared language, case-insensitively.
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Language::Python),
            "javascript" | "js" | "node" => Some(Language::JavaScript),
            _ => None,
        }
    }

    /// Unknown values fall back to Python, the platform default.
    pub fn coerce(value: &str) -> Self {
        Self::from_str(value).unwrap_or_default()
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::JavaScript => write!(f, "javascript"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

/// One hidden input/expected-output pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: String,
}

impl Fixture {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }
}

/// Resource ceiling for a single sandboxed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    pub cpu_ms: u64,
    pub wall_ms: u64,
    pub memory_mb: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            cpu_ms: 2_000,
            wall_ms: 5_000,
            memory_mb: 256,
        }
    }
}

impl ExecutionLimits {
    /// Cap every field at the operator ceiling. Zero values take the ceiling.
    pub fn clamp_to(&self, ceiling: &ExecutionLimits) -> ExecutionLimits {
        fn pick(requested: u64, max: u64) -> u64 {
            if requested == 0 {
                max
            } else {
                requested.min(max)
            }
        }
        ExecutionLimits {
            cpu_ms: pick(self.cpu_ms, ceiling.cpu_ms),
            wall_ms: pick(self.wall_ms, ceiling.wall_ms),
            memory_mb: pick(self.memory_mb, ceiling.memory_mb),
        }
    }
}

fn default_points() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub id: ChallengeId,
    pub title: String,
    pub slug: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default = "default_points")]
    pub points: u32,
    #[serde(default)]
    pub fixtures: Vec<Fixture>,
    #[serde(default)]
    pub starter_code: String,
    /// Empty means any enabled language.
    #[serde(default)]
    pub languages: Vec<Language>,
}

impl Challenge {
    /// Create a challenge whose slug is derived from the title and unique
    /// according to `is_taken`.
    pub fn new(id: ChallengeId, title: &str, is_taken: impl Fn(&str) -> bool) -> Self {
        Self {
            id,
            title: title.to_string(),
            slug: unique_slug(title, is_taken),
            difficulty: Difficulty::default(),
            points: default_points(),
            fixtures: Vec::new(),
            starter_code: String::new(),
            languages: Vec::new(),
        }
    }

    pub fn allows(&self, language: Language) -> bool {
        self.languages.is_empty() || self.languages.contains(&language)
    }
}

/// Lowercase ASCII slug; any run of other characters becomes one `-`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("challenge");
    }
    slug
}

/// Resolve collisions with a numeric suffix: `base`, `base-1`, `base-2`, ...
pub fn unique_slug(title: &str, is_taken: impl Fn(&str) -> bool) -> String {
    let base = slugify(title);
    if !is_taken(&base) {
        return base;
    }
    let mut counter = 1u32;
    loop {
        let candidate = format!("{}-{}", base, counter);
        if !is_taken(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Passed,
    Failed,
}

impl From<Verdict> for SubmissionStatus {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Passed => SubmissionStatus::Passed,
            Verdict::Failed => SubmissionStatus::Failed,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("submission {id} is already {status:?}")]
pub struct InvalidTransition {
    pub id: Uuid,
    pub status: SubmissionStatus,
}

/// An attempt record. Created pending, finalized exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub user_id: UserId,
    pub challenge_id: ChallengeId,
    pub code: String,
    pub language: Language,
    pub status: SubmissionStatus,
    pub attempt_number: u32,
    pub points_awarded: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Submission {
    pub fn pending(
        user_id: UserId,
        challenge_id: ChallengeId,
        code: String,
        language: Language,
        attempt_number: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            challenge_id,
            code,
            language,
            status: SubmissionStatus::Pending,
            attempt_number,
            points_awarded: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn finalize(&mut self, verdict: Verdict, points_awarded: u32) -> Result<(), InvalidTransition> {
        if self.status != SubmissionStatus::Pending {
            return Err(InvalidTransition {
                id: self.id,
                status: self.status,
            });
        }
        self.status = verdict.into();
        self.points_awarded = points_awarded;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub input: String,
    pub expected: String,
    pub user_output: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradingResult {
    pub status: Verdict,
    pub results: Vec<TestOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl GradingResult {
    pub fn passed(&self) -> bool {
        self.status == Verdict::Passed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Award {
    pub points_awarded: u32,
    pub already_rewarded: bool,
    /// The user's running total after this award. Absent when the ledger
    /// was not consulted (failing grades, zero-point challenges).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_points: Option<u64>,
}

/// Per-user progress on one challenge, derived from the attempt history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    NotStarted,
    Passed,
    Failed,
}

impl ChallengeStatus {
    pub fn of(submissions: &[Submission]) -> Self {
        if submissions.is_empty() {
            ChallengeStatus::NotStarted
        } else if submissions.iter().any(|s| s.status == SubmissionStatus::Passed) {
            ChallengeStatus::Passed
        } else {
            ChallengeStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Beginner,
    Intermediate,
    Advanced,
}

impl Level {
    pub fn from_points(total: u64) -> Self {
        match total {
            0..=49 => Level::Beginner,
            50..=149 => Level::Intermediate,
            _ => Level::Advanced,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Submit,
    DryRun,
}

/// Work item pushed onto a language queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeJob {
    pub id: Uuid,
    pub mode: JobMode,
    /// Present for `Submit` jobs. Its attempt number is assigned as the job is queued.
    #[serde(default)]
    pub submission: Option<Submission>,
    pub language: Language,
    pub source_code: String,
    pub fixtures: Vec<Fixture>,
    #[serde(default)]
    pub challenge_points: u32,
    #[serde(default)]
    pub limits: ExecutionLimits,
    /// How many times a worker has picked this job up.
    #[serde(default)]
    pub delivery: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Completed,
    Errored,
}

/// What a worker stores once a job is done.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeReport {
    pub job_id: Uuid,
    pub mode: JobMode,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission: Option<Submission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<GradingResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub award: Option<Award>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_parsing() {
        assert_eq!(Language::from_str("Python"), Some(Language::Python));
        assert_eq!(Language::from_str(" js "), Some(Language::JavaScript));
        assert_eq!(Language::from_str("cobol"), None);
        assert_eq!(Language::coerce("cobol"), Language::Python);
        assert_eq!(Language::JavaScript.to_string(), "javascript");
    }

    #[test]
    fn test_language_wire_format() {
        let lang: Language = serde_json::from_str("\"javascript\"").unwrap();
        assert_eq!(lang, Language::JavaScript);
        assert_eq!(serde_json::to_string(&Language::Python).unwrap(), "\"python\"");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Sum of Two Numbers"), "sum-of-two-numbers");
        assert_eq!(slugify("  FizzBuzz!!  2.0 "), "fizzbuzz-2-0");
        assert_eq!(slugify("???"), "challenge");
    }

    #[test]
    fn test_unique_slug_collision_suffix() {
        let taken = ["square", "square-1"];
        let slug = unique_slug("Square", |s| taken.contains(&s));
        assert_eq!(slug, "square-2");
        assert_eq!(unique_slug("Cube", |s| taken.contains(&s)), "cube");
    }

    #[test]
    fn test_challenge_defaults() {
        let challenge = Challenge::new(7, "Hello World", |_| false);
        assert_eq!(challenge.slug, "hello-world");
        assert_eq!(challenge.points, 10);
        assert_eq!(challenge.difficulty, Difficulty::Easy);
        assert!(challenge.allows(Language::JavaScript));

        let parsed: Challenge = serde_json::from_str(r#"{"id":1,"title":"t","slug":"t"}"#).unwrap();
        assert_eq!(parsed.points, 10);
    }

    #[test]
    fn test_submission_finalizes_once() {
        let mut submission = Submission::pending(1, 2, "print(1)".into(), Language::Python, 1);
        assert_eq!(submission.status, SubmissionStatus::Pending);

        submission.finalize(Verdict::Passed, 20).unwrap();
        assert_eq!(submission.status, SubmissionStatus::Passed);
        assert_eq!(submission.points_awarded, 20);

        let err = submission.finalize(Verdict::Failed, 0).unwrap_err();
        assert_eq!(err.status, SubmissionStatus::Passed);
        assert_eq!(submission.points_awarded, 20);
    }

    #[test]
    fn test_challenge_status() {
        assert_eq!(ChallengeStatus::of(&[]), ChallengeStatus::NotStarted);

        let mut failed = Submission::pending(1, 2, "x".into(), Language::Python, 1);
        failed.finalize(Verdict::Failed, 0).unwrap();
        assert_eq!(ChallengeStatus::of(&[failed.clone()]), ChallengeStatus::Failed);

        let mut passed = Submission::pending(1, 2, "x".into(), Language::Python, 2);
        passed.finalize(Verdict::Passed, 10).unwrap();
        assert_eq!(ChallengeStatus::of(&[failed, passed]), ChallengeStatus::Passed);
    }

    #[test]
    fn test_level_thresholds() {
        assert_eq!(Level::from_points(0), Level::Beginner);
        assert_eq!(Level::from_points(49), Level::Beginner);
        assert_eq!(Level::from_points(50), Level::Intermediate);
        assert_eq!(Level::from_points(150), Level::Advanced);
    }

    #[test]
    fn test_limits_clamp() {
        let ceiling = ExecutionLimits::default();
        let requested = ExecutionLimits {
            cpu_ms: 60_000,
            wall_ms: 0,
            memory_mb: 64,
        };
        let clamped = requested.clamp_to(&ceiling);
        assert_eq!(clamped.cpu_ms, ceiling.cpu_ms);
        assert_eq!(clamped.wall_ms, ceiling.wall_ms);
        assert_eq!(clamped.memory_mb, 64);
    }

    #[test]
    fn test_grading_result_wire_shape() {
        let result = GradingResult {
            status: Verdict::Passed,
            results: vec![TestOutcome {
                input: "3".into(),
                expected: "9".into(),
                user_output: "9\n".into(),
                passed: true,
                failure_reason: None,
            }],
            reason: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "passed");
        assert_eq!(json["results"][0]["user_output"], "9\n");
        assert!(json["results"][0].get("failure_reason").is_none());
        assert!(json.get("reason").is_none());
    }
}
