use chrono::{DateTime, Local, NaiveDate};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::decode::CodeDecoder;
use super::frames::FrameSource;
use crate::store::{StoreError, StudentIdentity};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Lookup seam over the identity store; the session only reads.
pub trait IdentityLookup {
    fn find_by_unique_id(&self, unique_id: &str) -> Result<Option<StudentIdentity>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The (student, day) row already exists, e.g. a concurrent session won
    /// the insert race. Callers treat this as success.
    AlreadyPresent,
}

/// Day-scoped existence check and insert. The ledger's (student, day)
/// uniqueness guarantee, not session memory, is the correctness boundary
/// for idempotence across restarted or concurrent sessions.
pub trait AttendanceLedger {
    fn exists_present(&self, student_id: &str, day: NaiveDate) -> Result<bool, StoreError>;
    fn insert_present(
        &self,
        student_id: &str,
        day: NaiveDate,
        marked_at: DateTime<Local>,
    ) -> Result<InsertOutcome, StoreError>;
}

/// Per-session state. `seen_today` is only a fast path to skip redundant
/// ledger round-trips within one run; it holds the unique ids this session
/// freshly marked, so `marks_made == seen_today.len()` always.
#[derive(Debug, Default)]
pub struct ScanSession {
    pub seen_today: HashSet<String>,
    pub frames_processed: u64,
    pub marks_made: u64,
}

pub struct SessionOptions {
    pub max_frames: Option<u64>,
    pub max_duration: Option<Duration>,
    /// Operator stop request, checked between frames, never mid-frame.
    pub stop: Option<Arc<AtomicBool>>,
    /// Consecutive storage failures tolerated before the session aborts.
    pub storage_failure_limit: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_frames: None,
            max_duration: None,
            stop: None,
            storage_failure_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Finished,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    StorageUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Finished,
    Aborted(AbortReason),
}

#[derive(Debug)]
pub struct SessionSummary {
    pub outcome: SessionOutcome,
    pub marks_made: u64,
    pub distinct_students_seen: u64,
    pub frames_processed: u64,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkOutcome {
    Marked,
    AlreadyPresent,
    Unknown,
    StorageFailed,
}

/// Drives one bounded scanning session: pull frame, decode, mark, repeat.
/// Idle -> Running -> Finished, or Running -> Aborted on sustained storage
/// loss. Opening the frame source (the step that can fail with
/// DeviceUnavailable) happens before the controller is built, so a run
/// always ends with a summary.
pub struct SessionController<'a> {
    frames: &'a mut dyn FrameSource,
    decoder: &'a dyn CodeDecoder,
    identities: &'a dyn IdentityLookup,
    ledger: &'a dyn AttendanceLedger,
    options: SessionOptions,
    state: SessionState,
}

impl<'a> SessionController<'a> {
    pub fn new(
        frames: &'a mut dyn FrameSource,
        decoder: &'a dyn CodeDecoder,
        identities: &'a dyn IdentityLookup,
        ledger: &'a dyn AttendanceLedger,
        options: SessionOptions,
    ) -> Self {
        Self {
            frames,
            decoder,
            identities,
            ledger,
            options,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn run(&mut self) -> SessionSummary {
        self.state = SessionState::Running;
        let started = Instant::now();
        let mut session = ScanSession::default();
        let mut storage_failures: u32 = 0;

        let outcome = loop {
            if self.stop_requested() {
                break SessionOutcome::Finished;
            }
            if let Some(max) = self.options.max_frames {
                if session.frames_processed >= max {
                    break SessionOutcome::Finished;
                }
            }
            if let Some(max) = self.options.max_duration {
                if started.elapsed() >= max {
                    break SessionOutcome::Finished;
                }
            }

            let Some(frame) = self.frames.next_frame() else {
                break SessionOutcome::Finished;
            };
            session.frames_processed += 1;

            let mut abort = None;
            for code in self.decoder.decode(&frame) {
                // Annotation side channel: where the code sat in the frame.
                debug!("decoded {:?} at {:?}", code.payload, code.region);
                if session.seen_today.contains(&code.payload) {
                    continue;
                }
                match mark_payload(&code.payload, &mut session, self.identities, self.ledger) {
                    MarkOutcome::StorageFailed => {
                        storage_failures += 1;
                        if storage_failures >= self.options.storage_failure_limit {
                            abort = Some(AbortReason::StorageUnavailable);
                            break;
                        }
                    }
                    _ => storage_failures = 0,
                }
            }
            if let Some(reason) = abort {
                break SessionOutcome::Aborted(reason);
            }
        };

        self.state = match outcome {
            SessionOutcome::Finished => SessionState::Finished,
            SessionOutcome::Aborted(_) => SessionState::Aborted,
        };
        SessionSummary {
            outcome,
            marks_made: session.marks_made,
            distinct_students_seen: session.seen_today.len() as u64,
            frames_processed: session.frames_processed,
            duration: started.elapsed(),
        }
    }

    fn stop_requested(&self) -> bool {
        self.options
            .stop
            .as_ref()
            .map(|s| s.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

/// The mark decision for one decoded payload, kept free of frame-pump and
/// rendering concerns so it is testable without a camera. A payload with no
/// matching student is ignored, an existing row for today is left alone,
/// and only a fresh insert counts toward the session tally.
fn mark_payload(
    payload: &str,
    session: &mut ScanSession,
    identities: &dyn IdentityLookup,
    ledger: &dyn AttendanceLedger,
) -> MarkOutcome {
    let student = match identities.find_by_unique_id(payload) {
        Err(e) => {
            warn!("identity lookup failed for {:?}: {}", payload, e);
            return MarkOutcome::StorageFailed;
        }
        Ok(None) => {
            debug!("no student registered for payload {:?}", payload);
            return MarkOutcome::Unknown;
        }
        Ok(Some(s)) => s,
    };

    let now = Local::now();
    let today = now.date_naive();
    match ledger.exists_present(&student.id, today) {
        Err(e) => {
            warn!("existence check failed for {}: {}", student.unique_id, e);
            MarkOutcome::StorageFailed
        }
        Ok(true) => MarkOutcome::AlreadyPresent,
        Ok(false) => match ledger.insert_present(&student.id, today, now) {
            Ok(InsertOutcome::Inserted) => {
                session.seen_today.insert(payload.to_string());
                session.marks_made += 1;
                info!("marked present: {} ({})", student.name, student.unique_id);
                MarkOutcome::Marked
            }
            Ok(InsertOutcome::AlreadyPresent) => MarkOutcome::AlreadyPresent,
            Err(e) => {
                warn!("insert failed for {}: {}", student.unique_id, e);
                MarkOutcome::StorageFailed
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::decode::{DecodedCode, Region};
    use image::GrayImage;
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};

    const REGION: Region = Region {
        x: 4,
        y: 4,
        width: 32,
        height: 32,
    };

    /// Yields `count` blank frames, then end-of-stream.
    struct BlankFrames {
        count: u64,
    }

    impl FrameSource for BlankFrames {
        fn next_frame(&mut self) -> Option<GrayImage> {
            if self.count == 0 {
                return None;
            }
            self.count -= 1;
            Some(GrayImage::new(1, 1))
        }
    }

    /// Scripted decoder: one payload list per frame, in order.
    struct ScriptedDecoder {
        per_frame: RefCell<VecDeque<Vec<&'static str>>>,
    }

    impl ScriptedDecoder {
        fn new(per_frame: Vec<Vec<&'static str>>) -> Self {
            Self {
                per_frame: RefCell::new(per_frame.into()),
            }
        }
    }

    impl CodeDecoder for ScriptedDecoder {
        fn decode(&self, _frame: &GrayImage) -> Vec<DecodedCode> {
            self.per_frame
                .borrow_mut()
                .pop_front()
                .unwrap_or_default()
                .into_iter()
                .map(|p| DecodedCode {
                    payload: p.to_string(),
                    region: REGION,
                })
                .collect()
        }
    }

    #[derive(Default)]
    struct FakeStore {
        students: HashMap<String, StudentIdentity>,
        rows: RefCell<HashSet<(String, String)>>,
        fail_ledger: bool,
    }

    impl FakeStore {
        fn with_students(unique_ids: &[&str]) -> Self {
            let mut students = HashMap::new();
            for uid in unique_ids {
                students.insert(
                    uid.to_string(),
                    StudentIdentity {
                        id: format!("row-{}", uid),
                        name: format!("Student {}", uid),
                        unique_id: uid.to_string(),
                        code_path: None,
                    },
                );
            }
            Self {
                students,
                ..Self::default()
            }
        }

        fn seed_present_today(&self, unique_id: &str) {
            let today = Local::now().date_naive().to_string();
            self.rows
                .borrow_mut()
                .insert((format!("row-{}", unique_id), today));
        }

        fn row_count(&self) -> usize {
            self.rows.borrow().len()
        }
    }

    impl IdentityLookup for FakeStore {
        fn find_by_unique_id(
            &self,
            unique_id: &str,
        ) -> Result<Option<StudentIdentity>, StoreError> {
            Ok(self.students.get(unique_id).cloned())
        }
    }

    impl AttendanceLedger for FakeStore {
        fn exists_present(&self, student_id: &str, day: NaiveDate) -> Result<bool, StoreError> {
            if self.fail_ledger {
                return Err(StoreError::Unavailable("ledger down".to_string()));
            }
            Ok(self
                .rows
                .borrow()
                .contains(&(student_id.to_string(), day.to_string())))
        }

        fn insert_present(
            &self,
            student_id: &str,
            day: NaiveDate,
            _marked_at: DateTime<Local>,
        ) -> Result<InsertOutcome, StoreError> {
            if self.fail_ledger {
                return Err(StoreError::Unavailable("ledger down".to_string()));
            }
            if self
                .rows
                .borrow_mut()
                .insert((student_id.to_string(), day.to_string()))
            {
                Ok(InsertOutcome::Inserted)
            } else {
                Ok(InsertOutcome::AlreadyPresent)
            }
        }
    }

    fn run_session(
        frame_count: u64,
        decoder: &ScriptedDecoder,
        store: &FakeStore,
        options: SessionOptions,
    ) -> (SessionSummary, SessionState) {
        let mut frames = BlankFrames { count: frame_count };
        let mut controller = SessionController::new(&mut frames, decoder, store, store, options);
        let summary = controller.run();
        (summary, controller.state())
    }

    #[test]
    fn repeated_and_distinct_payloads_mark_once_each() {
        let decoder = ScriptedDecoder::new(vec![vec!["S001"], vec!["S001"], vec!["S002"]]);
        let store = FakeStore::with_students(&["S001", "S002"]);
        let (summary, state) = run_session(3, &decoder, &store, SessionOptions::default());

        assert_eq!(state, SessionState::Finished);
        assert_eq!(summary.outcome, SessionOutcome::Finished);
        assert_eq!(summary.marks_made, 2);
        assert_eq!(summary.distinct_students_seen, 2);
        assert_eq!(summary.frames_processed, 3);
        assert_eq!(store.row_count(), 2);
    }

    #[test]
    fn already_marked_today_is_not_remarked() {
        let decoder = ScriptedDecoder::new(vec![vec!["S001"]]);
        let store = FakeStore::with_students(&["S001"]);
        store.seed_present_today("S001");
        let (summary, _) = run_session(1, &decoder, &store, SessionOptions::default());

        assert_eq!(summary.marks_made, 0);
        assert_eq!(summary.distinct_students_seen, 0);
        assert_eq!(store.row_count(), 1);
    }

    #[test]
    fn unknown_payload_is_ignored_and_loop_continues() {
        let decoder = ScriptedDecoder::new(vec![vec!["UNKNOWN"], vec!["S001"]]);
        let store = FakeStore::with_students(&["S001"]);
        let (summary, state) = run_session(2, &decoder, &store, SessionOptions::default());

        assert_eq!(state, SessionState::Finished);
        assert_eq!(summary.frames_processed, 2);
        assert_eq!(summary.marks_made, 1);
        assert_eq!(store.row_count(), 1);
    }

    #[test]
    fn end_of_stream_finishes_with_empty_summary() {
        let decoder = ScriptedDecoder::new(vec![]);
        let store = FakeStore::with_students(&[]);
        let (summary, state) = run_session(0, &decoder, &store, SessionOptions::default());

        assert_eq!(state, SessionState::Finished);
        assert_eq!(summary.marks_made, 0);
        assert_eq!(summary.frames_processed, 0);
    }

    #[test]
    fn all_codes_in_a_frame_are_processed_before_the_next_pull() {
        let decoder = ScriptedDecoder::new(vec![vec!["S001", "S002"]]);
        let store = FakeStore::with_students(&["S001", "S002"]);
        let (summary, _) = run_session(1, &decoder, &store, SessionOptions::default());

        assert_eq!(summary.frames_processed, 1);
        assert_eq!(summary.marks_made, 2);
    }

    #[test]
    fn stop_flag_ends_the_session_at_the_iteration_boundary() {
        let decoder = ScriptedDecoder::new(vec![vec!["S001"]]);
        let store = FakeStore::with_students(&["S001"]);
        let stop = Arc::new(AtomicBool::new(true));
        let options = SessionOptions {
            stop: Some(stop),
            ..SessionOptions::default()
        };
        let (summary, state) = run_session(5, &decoder, &store, options);

        assert_eq!(state, SessionState::Finished);
        assert_eq!(summary.frames_processed, 0);
        assert_eq!(summary.marks_made, 0);
    }

    #[test]
    fn max_frames_bounds_the_session() {
        let decoder = ScriptedDecoder::new(vec![vec![], vec![], vec![]]);
        let store = FakeStore::with_students(&[]);
        let options = SessionOptions {
            max_frames: Some(2),
            ..SessionOptions::default()
        };
        let (summary, _) = run_session(10, &decoder, &store, options);

        assert_eq!(summary.frames_processed, 2);
        assert_eq!(summary.outcome, SessionOutcome::Finished);
    }

    #[test]
    fn sustained_storage_loss_aborts_with_a_summary() {
        let decoder =
            ScriptedDecoder::new(vec![vec!["S001"], vec!["S001"], vec!["S001"], vec!["S001"]]);
        let mut store = FakeStore::with_students(&["S001"]);
        store.fail_ledger = true;
        let options = SessionOptions {
            storage_failure_limit: 3,
            ..SessionOptions::default()
        };
        let (summary, state) = run_session(10, &decoder, &store, options);

        assert_eq!(state, SessionState::Aborted);
        assert_eq!(
            summary.outcome,
            SessionOutcome::Aborted(AbortReason::StorageUnavailable)
        );
        assert_eq!(summary.marks_made, 0);
        assert_eq!(summary.frames_processed, 3);
    }

    #[test]
    fn lost_insert_race_is_benign_and_does_not_count() {
        // Another session inserts between our existence check and insert:
        // modelled by a ledger whose insert reports AlreadyPresent.
        struct RacyLedger<'a>(&'a FakeStore);
        impl IdentityLookup for RacyLedger<'_> {
            fn find_by_unique_id(
                &self,
                unique_id: &str,
            ) -> Result<Option<StudentIdentity>, StoreError> {
                self.0.find_by_unique_id(unique_id)
            }
        }
        impl AttendanceLedger for RacyLedger<'_> {
            fn exists_present(&self, _: &str, _: NaiveDate) -> Result<bool, StoreError> {
                Ok(false)
            }
            fn insert_present(
                &self,
                _: &str,
                _: NaiveDate,
                _: DateTime<Local>,
            ) -> Result<InsertOutcome, StoreError> {
                Ok(InsertOutcome::AlreadyPresent)
            }
        }

        let decoder = ScriptedDecoder::new(vec![vec!["S001"]]);
        let store = FakeStore::with_students(&["S001"]);
        let racy = RacyLedger(&store);
        let mut frames = BlankFrames { count: 1 };
        let mut controller = SessionController::new(
            &mut frames,
            &decoder,
            &racy,
            &racy,
            SessionOptions::default(),
        );
        let summary = controller.run();

        assert_eq!(summary.outcome, SessionOutcome::Finished);
        assert_eq!(summary.marks_made, 0);
        assert_eq!(summary.distinct_students_seen, 0);
    }
}
