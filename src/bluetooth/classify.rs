//! Classification of Bluetooth transport failures.
//!
//! The Windows serial stack reports RFCOMM trouble as a zoo of free-text
//! messages and `Unknown error code N` numbers. Retry and rediscovery
//! decisions key off two flags distilled from the text: whether the
//! failure is likely transient (worth retrying the same port) and whether
//! the OS-visible set of COM ports has likely changed (worth
//! re-enumerating).

use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use crate::bluetooth::ports::PlanStrategy;

/// Where in the connection lifecycle a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FailurePhase {
    Discovery,
    Probe,
    Send,
    Session,
    Open,
    Unknown,
}

impl FailurePhase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Probe => "probe",
            Self::Send => "send",
            Self::Session => "session",
            Self::Open => "open",
            Self::Unknown => "unknown",
        }
    }

    /// Tie-break order when picking the dominant phase of a summary.
    fn primacy(&self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Probe => 1,
            Self::Discovery => 2,
            Self::Send => 3,
            Self::Session => 4,
            Self::Unknown => 5,
        }
    }
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureClassification {
    pub phase: FailurePhase,
    pub windows_code: Option<u32>,
    pub likely_transient: bool,
    pub likely_dynamic_availability: bool,
}

static WINDOWS_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)unknown error code\s+(\d+)").expect("static pattern"));
static ACCESS_DENIED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)access (is )?denied").expect("static pattern"));
static SEMAPHORE_TIMEOUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)semaphore timeout period has expired").expect("static pattern")
});
static FILE_NOT_FOUND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)file not found").expect("static pattern"));
static NOT_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)is not open").expect("static pattern"));
static NO_CANDIDATES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)could not resolve|no serial com candidates|no com ports").expect("static pattern")
});
static SEND_ABORTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)send aborted").expect("static pattern"));

/// Windows error codes seen when an RFCOMM link drops mid-session; the
/// port usually works again after the radio settles.
const TRANSIENT_WINDOWS_CODES: [u32; 3] = [121, 1256, 1167];

/// Ordered phase rules; the first match wins.
fn phase_of(message: &str) -> FailurePhase {
    static DISCOVERY: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)could not resolve|enumerat|no serial com candidates|no com ports")
            .expect("static pattern")
    });
    static PROBE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)probe").expect("static pattern"));
    static SEND: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)send").expect("static pattern"));
    static SESSION: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)is not open|connection lost|session").expect("static pattern")
    });
    static OPEN: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)opening |could not open|failed to open").expect("static pattern")
    });

    if DISCOVERY.is_match(message) {
        FailurePhase::Discovery
    } else if PROBE.is_match(message) {
        FailurePhase::Probe
    } else if SEND.is_match(message) {
        FailurePhase::Send
    } else if SESSION.is_match(message) {
        FailurePhase::Session
    } else if OPEN.is_match(message) {
        FailurePhase::Open
    } else {
        FailurePhase::Unknown
    }
}

pub fn classify(message: &str, strategy: PlanStrategy) -> FailureClassification {
    let windows_code = WINDOWS_CODE
        .captures(message)
        .and_then(|captures| captures[1].parse::<u32>().ok());
    let code_is_transient =
        windows_code.is_some_and(|code| TRANSIENT_WINDOWS_CODES.contains(&code));

    let likely_transient = code_is_transient
        || ACCESS_DENIED.is_match(message)
        || SEMAPHORE_TIMEOUT.is_match(message)
        || (strategy == PlanStrategy::Ev3Priority && SEND_ABORTED.is_match(message));

    // The broader set: anything hinting that the COM port roster itself
    // moved under us, so a fresh enumeration round may see a different
    // world.
    let likely_dynamic_availability = code_is_transient
        || ACCESS_DENIED.is_match(message)
        || SEMAPHORE_TIMEOUT.is_match(message)
        || FILE_NOT_FOUND.is_match(message)
        || NOT_OPEN.is_match(message)
        || NO_CANDIDATES.is_match(message);

    FailureClassification {
        phase: phase_of(message),
        windows_code,
        likely_transient,
        likely_dynamic_availability,
    }
}

/// Aggregate view over one auto-port run's failure messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureSummary {
    pub total: usize,
    pub by_phase: BTreeMap<FailurePhase, usize>,
    pub windows_codes: Vec<u32>,
    pub likely_transient_count: usize,
    pub likely_dynamic_count: usize,
    pub primary_phase: FailurePhase,
}

impl FailureSummary {
    /// The one-line form embedded in the auto-port failure report.
    pub fn headline(&self) -> String {
        let codes = self
            .windows_codes
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "codes=[{}], phase={}, transient={}/{}, dynamic={}/{}",
            codes,
            self.primary_phase,
            self.likely_transient_count,
            self.total,
            self.likely_dynamic_count,
            self.total
        )
    }
}

pub fn summarize<S: AsRef<str>>(messages: &[S], strategy: PlanStrategy) -> FailureSummary {
    let mut by_phase: BTreeMap<FailurePhase, usize> = BTreeMap::new();
    let mut windows_codes = Vec::new();
    let mut likely_transient_count = 0;
    let mut likely_dynamic_count = 0;

    for message in messages {
        let classification = classify(message.as_ref(), strategy);
        *by_phase.entry(classification.phase).or_default() += 1;
        if let Some(code) = classification.windows_code
            && !windows_codes.contains(&code)
        {
            windows_codes.push(code);
        }
        if classification.likely_transient {
            likely_transient_count += 1;
        }
        if classification.likely_dynamic_availability {
            likely_dynamic_count += 1;
        }
    }
    windows_codes.sort_unstable();

    let primary_phase = by_phase
        .iter()
        .max_by(|(phase_a, count_a), (phase_b, count_b)| {
            count_a
                .cmp(count_b)
                .then(phase_b.primacy().cmp(&phase_a.primacy()))
        })
        .map(|(phase, _)| *phase)
        .unwrap_or(FailurePhase::Unknown);

    FailureSummary {
        total: messages.len(),
        by_phase,
        windows_codes,
        likely_transient_count,
        likely_dynamic_count,
        primary_phase,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_error_code_121_is_a_transient_open_failure() {
        let c = classify("Opening COM4: Unknown error code 121", PlanStrategy::Ev3Priority);
        assert_eq!(c.phase, FailurePhase::Open);
        assert_eq!(c.windows_code, Some(121));
        assert!(c.likely_transient);
        assert!(c.likely_dynamic_availability);
    }

    #[test]
    fn file_not_found_is_dynamic_but_not_transient() {
        let c = classify("Opening COM4: File not found", PlanStrategy::Ev3Priority);
        assert_eq!(c.phase, FailurePhase::Open);
        assert!(!c.likely_transient);
        assert!(c.likely_dynamic_availability);
    }

    #[test]
    fn send_aborted_transience_depends_on_the_strategy() {
        let priority = classify("Bluetooth SPP send aborted.", PlanStrategy::Ev3Priority);
        assert_eq!(priority.phase, FailurePhase::Send);
        assert!(priority.likely_transient);

        let legacy = classify("Bluetooth SPP send aborted.", PlanStrategy::LegacyOrder);
        assert_eq!(legacy.phase, FailurePhase::Send);
        assert!(!legacy.likely_transient);
    }

    #[test]
    fn probe_status_is_neither_transient_nor_dynamic() {
        let c = classify("Probe reply returned status 0x2.", PlanStrategy::Ev3Priority);
        assert_eq!(c.phase, FailurePhase::Probe);
        assert!(!c.likely_transient);
        assert!(!c.likely_dynamic_availability);
    }

    #[test]
    fn not_open_is_a_dynamic_session_failure() {
        let c = classify("Bluetooth transport is not open.", PlanStrategy::Ev3Priority);
        assert_eq!(c.phase, FailurePhase::Session);
        assert!(c.likely_dynamic_availability);
    }

    #[test]
    fn access_denied_variants_are_transient() {
        for message in ["Opening COM5: Access denied", "Opening COM5: Access is denied."] {
            let c = classify(message, PlanStrategy::LegacyOrder);
            assert!(c.likely_transient, "{message}");
        }
    }

    #[test]
    fn summary_counts_phases_codes_and_flags() {
        let summary = summarize(
            &[
                "Opening COM4: Unknown error code 121",
                "Opening COM5: Access denied",
                "Unexpected reply type 0x5 during BT port probe.",
                "Bluetooth transport could not resolve any serial COM candidates.",
            ],
            PlanStrategy::Ev3Priority,
        );
        assert_eq!(summary.total, 4);
        assert_eq!(summary.by_phase.get(&FailurePhase::Open), Some(&2));
        assert_eq!(summary.by_phase.get(&FailurePhase::Probe), Some(&1));
        assert_eq!(summary.by_phase.get(&FailurePhase::Discovery), Some(&1));
        assert_eq!(summary.primary_phase, FailurePhase::Open);
        assert_eq!(summary.windows_codes, vec![121]);
        assert!(summary.likely_transient_count >= 2);
        assert!(summary.likely_dynamic_count >= 3);
    }

    #[test]
    fn primary_phase_tie_break_prefers_open_then_probe() {
        let summary = summarize(
            &[
                "Unexpected reply type 0x5 during BT port probe.",
                "Opening COM4: File not found",
            ],
            PlanStrategy::Ev3Priority,
        );
        assert_eq!(summary.primary_phase, FailurePhase::Open);

        let summary = summarize(
            &[
                "Unexpected reply type 0x5 during BT port probe.",
                "Bluetooth SPP send aborted.",
            ],
            PlanStrategy::Ev3Priority,
        );
        assert_eq!(summary.primary_phase, FailurePhase::Probe);
    }

    #[test]
    fn headline_reads_as_one_line() {
        let summary = summarize(
            &["Opening COM4: Unknown error code 121"],
            PlanStrategy::Ev3Priority,
        );
        assert_eq!(summary.headline(), "codes=[121], phase=open, transient=1/1, dynamic=1/1");
    }
}
