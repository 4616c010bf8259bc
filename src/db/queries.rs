use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, Connection};

use crate::models::{
    Appointment, AppointmentStatus, BookingSession, Doctor, PipelineStage, Slot,
};

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn format_ts(dt: &NaiveDateTime) -> String {
    dt.format(TS_FORMAT).to_string()
}

fn parse_ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, TS_FORMAT).unwrap_or_else(|_| Utc::now().naive_utc())
}

// ── Sessions ──

pub fn get_session(conn: &Connection, conversation_id: &str) -> anyhow::Result<Option<BookingSession>> {
    let now = format_ts(&Utc::now().naive_utc());
    let mut stmt = conn.prepare(
        "SELECT conversation_id, stage, data, last_activity, expires_at
         FROM sessions WHERE conversation_id = ?1 AND expires_at > ?2",
    )?;

    let result = stmt.query_row(params![conversation_id, now], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    });

    match result {
        Ok((conversation_id, stage_str, data_json, last_activity, expires_at)) => {
            let data: serde_json::Value =
                serde_json::from_str(&data_json).unwrap_or(serde_json::json!({}));

            let mut session = BookingSession::new(&conversation_id);
            session.stage = PipelineStage::parse(&stage_str);
            session.verification = data
                .get("verification")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or(session.verification);
            session.identity = data
                .get("identity")
                .and_then(|v| serde_json::from_value(v.clone()).ok());
            session.candidate_slots = data
                .get("candidate_slots")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            session.selected_slot = data
                .get("selected_slot")
                .and_then(|v| serde_json::from_value(v.clone()).ok());
            session.appointment_ref = data
                .get("appointment_ref")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            session.last_activity = parse_ts(&last_activity);
            session.expires_at = parse_ts(&expires_at);

            Ok(Some(session))
        }
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn save_session(conn: &Connection, session: &BookingSession) -> anyhow::Result<()> {
    let data = serde_json::json!({
        "verification": session.verification,
        "identity": session.identity,
        "candidate_slots": session.candidate_slots,
        "selected_slot": session.selected_slot,
        "appointment_ref": session.appointment_ref,
    });

    conn.execute(
        "INSERT INTO sessions (conversation_id, stage, data, last_activity, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(conversation_id) DO UPDATE SET
           stage = excluded.stage,
           data = excluded.data,
           last_activity = excluded.last_activity,
           expires_at = excluded.expires_at",
        params![
            session.conversation_id,
            session.stage.as_str(),
            serde_json::to_string(&data)?,
            format_ts(&session.last_activity),
            format_ts(&session.expires_at),
        ],
    )?;
    Ok(())
}

pub fn delete_session(conn: &Connection, conversation_id: &str) -> anyhow::Result<bool> {
    let count = conn.execute(
        "DELETE FROM sessions WHERE conversation_id = ?1",
        params![conversation_id],
    )?;
    Ok(count > 0)
}

pub fn expire_old_sessions(conn: &Connection) -> anyhow::Result<usize> {
    let now = format_ts(&Utc::now().naive_utc());
    let count = conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now])?;
    Ok(count)
}

// ── Doctors ──

pub fn search_doctors(
    conn: &Connection,
    specialty: Option<&str>,
    language: Option<&str>,
) -> anyhow::Result<Vec<Doctor>> {
    let mut stmt = conn.prepare("SELECT name, specialty, languages FROM doctors ORDER BY name")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut doctors = Vec::new();
    for row in rows {
        let (name, doc_specialty, languages) = row?;
        let languages: Vec<String> = languages
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.trim().to_string())
            .collect();

        if let Some(wanted) = specialty {
            if !doc_specialty.eq_ignore_ascii_case(wanted) {
                continue;
            }
        }
        if let Some(wanted) = language {
            if !languages.iter().any(|l| l.eq_ignore_ascii_case(wanted)) {
                continue;
            }
        }

        doctors.push(Doctor {
            name,
            specialty: doc_specialty,
            languages,
        });
    }
    Ok(doctors)
}

pub fn get_doctor(conn: &Connection, name: &str) -> anyhow::Result<Option<Doctor>> {
    let result = conn.query_row(
        "SELECT name, specialty, languages FROM doctors WHERE name = ?1 COLLATE NOCASE",
        params![name],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        },
    );

    match result {
        Ok((name, specialty, languages)) => Ok(Some(Doctor {
            name,
            specialty,
            languages: languages
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.trim().to_string())
                .collect(),
        })),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ── Schedule / availability ──

pub fn add_schedule_slot(conn: &Connection, doctor: &str, start: &NaiveDateTime) -> anyhow::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schedule (doctor, start) VALUES (?1, ?2)",
        params![doctor, format_ts(start)],
    )?;
    Ok(())
}

/// Open slots in the range: scheduled entries that do not collide with a
/// confirmed appointment for the same doctor.
pub fn open_slots(
    conn: &Connection,
    specialty: Option<&str>,
    doctor: Option<&str>,
    from: &NaiveDateTime,
    to: &NaiveDateTime,
) -> anyhow::Result<Vec<Slot>> {
    let mut stmt = conn.prepare(
        "SELECT s.doctor, d.specialty, s.start
         FROM schedule s
         JOIN doctors d ON d.name = s.doctor
         WHERE s.start >= ?1 AND s.start <= ?2
           AND NOT EXISTS (
             SELECT 1 FROM appointments a
             WHERE a.doctor = s.doctor AND a.start = s.start AND a.status = 'confirmed'
           )
         ORDER BY s.start",
    )?;

    let rows = stmt.query_map(params![format_ts(from), format_ts(to)], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut slots = Vec::new();
    for row in rows {
        let (slot_doctor, slot_specialty, start) = row?;
        if let Some(wanted) = doctor {
            if !slot_doctor.eq_ignore_ascii_case(wanted) {
                continue;
            }
        }
        if let Some(wanted) = specialty {
            if !slot_specialty.eq_ignore_ascii_case(wanted) {
                continue;
            }
        }
        slots.push(Slot {
            doctor: slot_doctor,
            specialty: slot_specialty,
            start: parse_ts(&start),
        });
    }
    Ok(slots)
}

// ── Appointments ──

pub fn create_appointment(conn: &Connection, appointment: &Appointment) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO appointments
           (reference, doctor, specialty, start, patient_name, reason, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            appointment.reference,
            appointment.doctor,
            appointment.specialty,
            format_ts(&appointment.start),
            appointment.patient_name,
            appointment.reason,
            appointment.status.as_str(),
            format_ts(&appointment.created_at),
            format_ts(&appointment.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_appointment(conn: &Connection, reference: &str) -> anyhow::Result<Option<Appointment>> {
    let result = conn.query_row(
        "SELECT reference, doctor, specialty, start, patient_name, reason, status, created_at, updated_at
         FROM appointments WHERE reference = ?1",
        params![reference],
        |row| {
            Ok(Appointment {
                reference: row.get(0)?,
                doctor: row.get(1)?,
                specialty: row.get(2)?,
                start: parse_ts(&row.get::<_, String>(3)?),
                patient_name: row.get(4)?,
                reason: row.get(5)?,
                status: AppointmentStatus::parse(&row.get::<_, String>(6)?),
                created_at: parse_ts(&row.get::<_, String>(7)?),
                updated_at: parse_ts(&row.get::<_, String>(8)?),
            })
        },
    );

    match result {
        Ok(appointment) => Ok(Some(appointment)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn list_appointments(conn: &Connection) -> anyhow::Result<Vec<Appointment>> {
    let mut stmt = conn.prepare(
        "SELECT reference, doctor, specialty, start, patient_name, reason, status, created_at, updated_at
         FROM appointments ORDER BY start",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(Appointment {
            reference: row.get(0)?,
            doctor: row.get(1)?,
            specialty: row.get(2)?,
            start: parse_ts(&row.get::<_, String>(3)?),
            patient_name: row.get(4)?,
            reason: row.get(5)?,
            status: AppointmentStatus::parse(&row.get::<_, String>(6)?),
            created_at: parse_ts(&row.get::<_, String>(7)?),
            updated_at: parse_ts(&row.get::<_, String>(8)?),
        })
    })?;

    let mut appointments = Vec::new();
    for row in rows {
        appointments.push(row?);
    }
    Ok(appointments)
}

pub fn update_appointment_status(
    conn: &Connection,
    reference: &str,
    status: &AppointmentStatus,
) -> anyhow::Result<bool> {
    let now = format_ts(&Utc::now().naive_utc());
    let count = conn.execute(
        "UPDATE appointments SET status = ?1, updated_at = ?2 WHERE reference = ?3",
        params![status.as_str(), now, reference],
    )?;
    Ok(count > 0)
}

pub fn update_appointment_start(
    conn: &Connection,
    reference: &str,
    start: &NaiveDateTime,
) -> anyhow::Result<bool> {
    let now = format_ts(&Utc::now().naive_utc());
    let count = conn.execute(
        "UPDATE appointments SET start = ?1, updated_at = ?2 WHERE reference = ?3",
        params![format_ts(start), now, reference],
    )?;
    Ok(count > 0)
}
