use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;
use uuid::Uuid;

use crate::auth::{AdvisorIdentity, AdvisorRegistry};
use crate::engine::{Engine, EngineError, SemesterRef};
use crate::limits::MAX_WIRE_LINE_LEN;
use crate::model::{EmailStatus, Ts};
use crate::observability;

/// One command per line, JSON-encoded, tagged by `cmd`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Hello {
        advisor: String,
        password: String,
    },
    CreateSemester {
        display_name: String,
        start: Ts,
        end: Ts,
    },
    DeleteSemester {
        id: Ulid,
    },
    ListSemesters,
    GetSemester {
        id: Ulid,
    },
    ActiveSemester,
    CreateSlot {
        start: Ts,
        semester_id: Option<Ulid>,
    },
    CreateSlots {
        starts: Vec<Ts>,
        semester_id: Option<Ulid>,
        timezone: Option<String>,
    },
    DeleteSlot {
        id: Ulid,
    },
    ListSlots {
        semester_id: Option<Ulid>,
    },
    CreateStudent {
        name: String,
        email: Option<String>,
        phone: Option<String>,
    },
    UpdateStudent {
        id: Ulid,
        name: String,
        email: Option<String>,
        phone: Option<String>,
    },
    DeleteStudent {
        id: Ulid,
    },
    ListStudents,
    CreateMeeting {
        student_id: Ulid,
        semester_id: Option<Ulid>,
    },
    DeleteMeeting {
        id: Ulid,
    },
    ListMeetings {
        semester_id: Ulid,
    },
    GetMeeting {
        code: Uuid,
    },
    ListOpenSlots {
        meeting_id: Ulid,
        code: Uuid,
    },
    Book {
        meeting_id: Ulid,
        slot_id: Ulid,
        code: Uuid,
        email: Option<String>,
        phone: Option<String>,
    },
    Cancel {
        meeting_id: Ulid,
    },
    CancelWithCode {
        meeting_id: Ulid,
        code: Uuid,
    },
    ListEmails,
    EmailEvent {
        message_id: String,
        status: EmailStatus,
    },
    Watch {
        semester_id: Ulid,
    },
    Unwatch {
        semester_id: Ulid,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        code: &'static str,
        message: String,
    },
    Event {
        semester_id: Ulid,
        event: crate::model::Event,
    },
}

impl Response {
    fn ok(data: impl Serialize) -> Response {
        match serde_json::to_value(data) {
            Ok(v) => Response::Ok { data: Some(v) },
            Err(e) => Response::Error {
                code: "internal",
                message: format!("response serialization failed: {e}"),
            },
        }
    }

    fn done() -> Response {
        Response::Ok { data: None }
    }
}

impl From<EngineError> for Response {
    fn from(e: EngineError) -> Response {
        Response::Error {
            code: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Empty strings from form-style clients mean "not provided".
fn blank_to_none(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

const NOT_AN_ADVISOR: &str = "You must be an advisor to perform this operation";

struct Session {
    engine: Arc<Engine>,
    registry: Arc<AdvisorRegistry>,
    advisor: Option<AdvisorIdentity>,
    /// One forwarding task per watched semester.
    watches: HashMap<Ulid, JoinHandle<()>>,
    out_tx: mpsc::Sender<String>,
}

impl Session {
    fn advisor_id(&self) -> Result<Ulid, EngineError> {
        self.advisor
            .as_ref()
            .map(|a| a.id)
            .ok_or(EngineError::Forbidden(NOT_AN_ADVISOR))
    }

    fn semester_ref(id: Option<Ulid>) -> SemesterRef {
        match id {
            Some(id) => SemesterRef::Id(id),
            None => SemesterRef::Active,
        }
    }

    async fn handle(&mut self, req: Request) -> Response {
        let label = observability::command_label(&req);
        let start = std::time::Instant::now();
        let response = self.dispatch(req).await;
        let status = match &response {
            Response::Ok { .. } => "ok",
            Response::Error { code, .. } => code,
            Response::Event { .. } => "event",
        };
        metrics::counter!(observability::COMMANDS_TOTAL, "command" => label, "status" => status.to_string())
            .increment(1);
        metrics::histogram!(observability::COMMAND_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        response
    }

    async fn dispatch(&mut self, req: Request) -> Response {
        match req {
            Request::Hello { advisor, password } => {
                match self.registry.verify(&advisor, &password) {
                    Some(identity) => {
                        tracing::info!(advisor = %identity.name, "advisor session opened");
                        self.advisor = Some(identity.clone());
                        Response::ok(serde_json::json!({
                            "advisor_id": identity.id,
                            "name": identity.name,
                        }))
                    }
                    None => {
                        metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                        Response::Error {
                            code: "forbidden",
                            message: "Invalid advisor credentials".into(),
                        }
                    }
                }
            }
            Request::CreateSemester {
                display_name,
                start,
                end,
            } => match self.advisor_id() {
                Ok(advisor) => match self
                    .engine
                    .create_semester(advisor, display_name, start, end)
                    .await
                {
                    Ok(id) => Response::ok(serde_json::json!({ "id": id })),
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            },
            Request::DeleteSemester { id } => match self.advisor_id() {
                Ok(advisor) => match self.engine.delete_semester(advisor, id).await {
                    Ok(()) => Response::done(),
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            },
            Request::ListSemesters => match self.advisor_id() {
                Ok(advisor) => Response::ok(self.engine.list_semesters(advisor)),
                Err(e) => e.into(),
            },
            Request::GetSemester { id } => match self.advisor_id() {
                Ok(advisor) => match self.engine.get_semester(advisor, id) {
                    Ok(semester) => Response::ok(semester),
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            },
            Request::ActiveSemester => match self.advisor_id() {
                Ok(advisor) => match self.engine.active_semester(advisor) {
                    Ok(semester) => Response::ok(semester),
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            },
            Request::CreateSlot { start, semester_id } => match self.advisor_id() {
                Ok(advisor) => match self
                    .engine
                    .create_time_slot(advisor, Self::semester_ref(semester_id), start)
                    .await
                {
                    Ok(id) => Response::ok(serde_json::json!({ "id": id })),
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            },
            Request::CreateSlots {
                starts,
                semester_id,
                timezone,
            } => match self.advisor_id() {
                Ok(advisor) => match self
                    .engine
                    .create_time_slots(advisor, Self::semester_ref(semester_id), starts, timezone)
                    .await
                {
                    Ok(ids) => Response::ok(serde_json::json!({ "ids": ids })),
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            },
            Request::DeleteSlot { id } => match self.advisor_id() {
                Ok(advisor) => match self.engine.delete_time_slot(advisor, id).await {
                    Ok(_) => Response::done(),
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            },
            Request::ListSlots { semester_id } => match self.advisor_id() {
                Ok(advisor) => match self
                    .engine
                    .list_slots(advisor, Self::semester_ref(semester_id))
                    .await
                {
                    Ok(slots) => Response::ok(slots),
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            },
            Request::CreateStudent { name, email, phone } => match self.advisor_id() {
                Ok(advisor) => match self
                    .engine
                    .create_student(advisor, name, blank_to_none(email), blank_to_none(phone))
                    .await
                {
                    Ok(id) => Response::ok(serde_json::json!({ "id": id })),
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            },
            Request::UpdateStudent {
                id,
                name,
                email,
                phone,
            } => match self.advisor_id() {
                Ok(advisor) => match self
                    .engine
                    .update_student(advisor, id, name, blank_to_none(email), blank_to_none(phone))
                    .await
                {
                    Ok(()) => Response::done(),
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            },
            Request::DeleteStudent { id } => match self.advisor_id() {
                Ok(advisor) => match self.engine.delete_student(advisor, id).await {
                    Ok(()) => Response::done(),
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            },
            Request::ListStudents => match self.advisor_id() {
                Ok(advisor) => Response::ok(self.engine.list_students(advisor).await),
                Err(e) => e.into(),
            },
            Request::CreateMeeting {
                student_id,
                semester_id,
            } => match self.advisor_id() {
                Ok(advisor) => match self
                    .engine
                    .create_meeting(advisor, student_id, Self::semester_ref(semester_id))
                    .await
                {
                    Ok(id) => Response::ok(serde_json::json!({ "id": id })),
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            },
            Request::DeleteMeeting { id } => match self.advisor_id() {
                Ok(advisor) => match self.engine.delete_meeting(advisor, id).await {
                    Ok(()) => Response::done(),
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            },
            Request::ListMeetings { semester_id } => match self.advisor_id() {
                Ok(advisor) => match self.engine.list_meetings(advisor, semester_id).await {
                    Ok(meetings) => Response::ok(meetings),
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            },
            // Student-facing: gated by the secret code, no session needed.
            Request::GetMeeting { code } => match self.engine.meeting_page_by_code(code).await {
                Ok(page) => Response::ok(page),
                Err(e) => e.into(),
            },
            Request::ListOpenSlots { meeting_id, code } => {
                match self.engine.list_slots_for_meeting(meeting_id, code).await {
                    Ok(slots) => Response::ok(slots),
                    Err(e) => e.into(),
                }
            }
            Request::Book {
                meeting_id,
                slot_id,
                code,
                email,
                phone,
            } => {
                let email = blank_to_none(email);
                let phone = blank_to_none(phone);
                match self
                    .engine
                    .book_meeting(meeting_id, slot_id, code, email.as_deref(), phone.as_deref())
                    .await
                {
                    Ok(()) => Response::done(),
                    Err(e) => e.into(),
                }
            }
            Request::Cancel { meeting_id } => match self.advisor_id() {
                Ok(advisor) => match self.engine.cancel_booking(advisor, meeting_id).await {
                    Ok(()) => Response::done(),
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            },
            Request::CancelWithCode { meeting_id, code } => {
                match self.engine.cancel_booking_with_code(meeting_id, code).await {
                    Ok(()) => Response::done(),
                    Err(e) => e.into(),
                }
            }
            Request::ListEmails => match self.advisor_id() {
                Ok(advisor) => Response::ok(self.engine.list_emails(advisor)),
                Err(e) => e.into(),
            },
            Request::EmailEvent { message_id, status } => match self.advisor_id() {
                Ok(_) => match self.engine.email_event(&message_id, status).await {
                    Ok(()) => Response::done(),
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            },
            Request::Watch { semester_id } => {
                if self.watches.contains_key(&semester_id) {
                    return Response::done();
                }
                let mut rx = self.engine.notify.subscribe(semester_id);
                let out_tx = self.out_tx.clone();
                let handle = tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(event) => {
                                let response = Response::Event { semester_id, event };
                                let line = match serde_json::to_string(&response) {
                                    Ok(l) => l,
                                    Err(_) => continue,
                                };
                                if out_tx.send(line).await.is_err() {
                                    break; // connection gone
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                tracing::warn!(%semester_id, missed = n, "watcher lagged");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
                self.watches.insert(semester_id, handle);
                Response::done()
            }
            Request::Unwatch { semester_id } => {
                if let Some(handle) = self.watches.remove(&semester_id) {
                    handle.abort();
                }
                Response::done()
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for handle in self.watches.values() {
            handle.abort();
        }
    }
}

/// Drive one client connection: newline-delimited JSON requests in,
/// responses and watched events out. Works over plain TCP or TLS.
pub async fn process_connection<S>(
    stream: S,
    peer: SocketAddr,
    engine: Arc<Engine>,
    registry: Arc<AdvisorRegistry>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let codec = LinesCodec::new_with_max_length(MAX_WIRE_LINE_LEN);
    let framed = Framed::new(stream, codec);
    let (mut sink, mut lines) = framed.split::<String>();

    // Responses and watch events share one ordered writer.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if sink.send(line).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session {
        engine,
        registry,
        advisor: None,
        watches: HashMap::new(),
        out_tx: out_tx.clone(),
    };

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "bad frame, closing connection");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(req) => session.handle(req).await,
            Err(e) => Response::Error {
                code: "bad_request",
                message: format!("malformed request: {e}"),
            },
        };

        let encoded = serde_json::to_string(&response)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if out_tx.send(encoded).await.is_err() {
            break;
        }
    }

    drop(session);
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}
