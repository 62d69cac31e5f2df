//! Record store over the workspace database.
//!
//! Every school-scoped collection is read with [`get`] and written with
//! [`save`], which replaces the whole collection for that school: records
//! missing from the list are removed (in dependency order), the rest are
//! upserted in list order. Callers wrap multi-collection writes in a
//! transaction.

use crate::model::{
    Exam, Gender, GradeLevel, GradeRecord, Invitation, Role, School, SchoolClass, Semester,
    Student, SubjectGrade, User,
};
use rusqlite::{Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, HashMap, HashSet};

pub trait ScopedRecord: Sized {
    const TABLE: &'static str;

    fn id(&self) -> &str;

    fn load(conn: &Connection, school_id: &str) -> rusqlite::Result<Vec<Self>>;

    fn upsert(&self, conn: &Connection, school_id: &str, sort_order: i64) -> rusqlite::Result<()>;

    fn remove(conn: &Connection, id: &str) -> rusqlite::Result<()> {
        conn.execute(&format!("DELETE FROM {} WHERE id = ?", Self::TABLE), [id])?;
        Ok(())
    }
}

pub fn get<T: ScopedRecord>(conn: &Connection, school_id: &str) -> rusqlite::Result<Vec<T>> {
    T::load(conn, school_id)
}

pub fn save<T: ScopedRecord>(
    conn: &Connection,
    school_id: &str,
    items: &[T],
) -> rusqlite::Result<()> {
    let keep: HashSet<&str> = items.iter().map(|i| i.id()).collect();
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM {} WHERE school_id = ?",
        T::TABLE
    ))?;
    let existing = stmt
        .query_map([school_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for id in existing.iter().filter(|id| !keep.contains(id.as_str())) {
        T::remove(conn, id)?;
    }
    for (i, item) in items.iter().enumerate() {
        item.upsert(conn, school_id, i as i64)?;
    }
    Ok(())
}

fn next_sort_order(conn: &Connection, table: &str, school_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        &format!(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM {} WHERE school_id = ?",
            table
        ),
        [school_id],
        |r| r.get(0),
    )
}

impl ScopedRecord for Semester {
    const TABLE: &'static str = "semesters";

    fn id(&self) -> &str {
        &self.id
    }

    fn load(conn: &Connection, school_id: &str) -> rusqlite::Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, school_id, name, is_current FROM semesters
             WHERE school_id = ? ORDER BY sort_order, rowid",
        )?;
        let rows = stmt
            .query_map([school_id], |r| {
                Ok(Semester {
                    id: r.get(0)?,
                    school_id: r.get(1)?,
                    name: r.get(2)?,
                    is_current: r.get::<_, i64>(3)? != 0,
                })
            })?
            .collect();
        rows
    }

    fn upsert(&self, conn: &Connection, school_id: &str, sort_order: i64) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO semesters(id, school_id, name, is_current, sort_order)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               is_current = excluded.is_current,
               sort_order = excluded.sort_order
             WHERE semesters.school_id = excluded.school_id",
            (
                &self.id,
                school_id,
                &self.name,
                self.is_current as i64,
                sort_order,
            ),
        )?;
        Ok(())
    }
}

impl ScopedRecord for GradeLevel {
    const TABLE: &'static str = "grade_levels";

    fn id(&self) -> &str {
        &self.id
    }

    fn load(conn: &Connection, school_id: &str) -> rusqlite::Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, school_id, name FROM grade_levels
             WHERE school_id = ? ORDER BY sort_order, rowid",
        )?;
        let rows = stmt
            .query_map([school_id], |r| {
                Ok(GradeLevel {
                    id: r.get(0)?,
                    school_id: r.get(1)?,
                    name: r.get(2)?,
                })
            })?
            .collect();
        rows
    }

    fn upsert(&self, conn: &Connection, school_id: &str, sort_order: i64) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO grade_levels(id, school_id, name, sort_order)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               sort_order = excluded.sort_order
             WHERE grade_levels.school_id = excluded.school_id",
            (&self.id, school_id, &self.name, sort_order),
        )?;
        Ok(())
    }

    fn remove(conn: &Connection, id: &str) -> rusqlite::Result<()> {
        // Classes still pointing at the grade make this fail on the FK.
        conn.execute("DELETE FROM invitations WHERE grade_id = ?", [id])?;
        conn.execute("DELETE FROM grade_levels WHERE id = ?", [id])?;
        Ok(())
    }
}

fn class_from_row(r: &Row) -> rusqlite::Result<SchoolClass> {
    let subject_teachers_json: String = r.get(5)?;
    Ok(SchoolClass {
        id: r.get(0)?,
        school_id: r.get(1)?,
        grade_id: r.get(2)?,
        name: r.get(3)?,
        class_teacher_id: r.get(4)?,
        subject_teachers: serde_json::from_str::<BTreeMap<String, String>>(&subject_teachers_json)
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
            })?,
    })
}

impl ScopedRecord for SchoolClass {
    const TABLE: &'static str = "classes";

    fn id(&self) -> &str {
        &self.id
    }

    fn load(conn: &Connection, school_id: &str) -> rusqlite::Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, school_id, grade_id, name, class_teacher_id, subject_teachers_json
             FROM classes WHERE school_id = ? ORDER BY sort_order, rowid",
        )?;
        let rows = stmt.query_map([school_id], class_from_row)?.collect();
        rows
    }

    fn upsert(&self, conn: &Connection, school_id: &str, sort_order: i64) -> rusqlite::Result<()> {
        let subject_teachers_json =
            serde_json::to_string(&self.subject_teachers).unwrap_or_else(|_| "{}".to_string());
        conn.execute(
            "INSERT INTO classes(id, school_id, grade_id, name, class_teacher_id, subject_teachers_json, sort_order)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               grade_id = excluded.grade_id,
               name = excluded.name,
               class_teacher_id = excluded.class_teacher_id,
               subject_teachers_json = excluded.subject_teachers_json,
               sort_order = excluded.sort_order
             WHERE classes.school_id = excluded.school_id",
            (
                &self.id,
                school_id,
                &self.grade_id,
                &self.name,
                &self.class_teacher_id,
                &subject_teachers_json,
                sort_order,
            ),
        )?;
        Ok(())
    }
}

impl ScopedRecord for Student {
    const TABLE: &'static str = "students";

    fn id(&self) -> &str {
        &self.id
    }

    fn load(conn: &Connection, school_id: &str) -> rusqlite::Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, school_id, grade_id, class_id, name, student_no FROM students
             WHERE school_id = ? ORDER BY sort_order, rowid",
        )?;
        let rows = stmt
            .query_map([school_id], |r| {
                Ok(Student {
                    id: r.get(0)?,
                    school_id: r.get(1)?,
                    grade_id: r.get(2)?,
                    class_id: r.get(3)?,
                    name: r.get(4)?,
                    student_no: r.get(5)?,
                })
            })?
            .collect();
        rows
    }

    fn upsert(&self, conn: &Connection, school_id: &str, sort_order: i64) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO students(id, school_id, grade_id, class_id, name, student_no, sort_order)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               grade_id = excluded.grade_id,
               class_id = excluded.class_id,
               name = excluded.name,
               student_no = excluded.student_no,
               sort_order = excluded.sort_order
             WHERE students.school_id = excluded.school_id",
            (
                &self.id,
                school_id,
                &self.grade_id,
                &self.class_id,
                &self.name,
                &self.student_no,
                sort_order,
            ),
        )?;
        Ok(())
    }

    fn remove(conn: &Connection, id: &str) -> rusqlite::Result<()> {
        // No ON DELETE CASCADE; delete dependents explicitly.
        conn.execute(
            "DELETE FROM subject_scores
             WHERE record_id IN (SELECT id FROM grade_records WHERE student_id = ?)",
            [id],
        )?;
        conn.execute("DELETE FROM grade_records WHERE student_id = ?", [id])?;
        conn.execute("DELETE FROM parent_children WHERE student_id = ?", [id])?;
        conn.execute("DELETE FROM students WHERE id = ?", [id])?;
        Ok(())
    }
}

/// Lookup across schools, for callers (parents) that hold only a student id.
pub fn student_by_id(conn: &Connection, id: &str) -> rusqlite::Result<Option<Student>> {
    conn.query_row(
        "SELECT id, school_id, grade_id, class_id, name, student_no FROM students WHERE id = ?",
        [id],
        |r| {
            Ok(Student {
                id: r.get(0)?,
                school_id: r.get(1)?,
                grade_id: r.get(2)?,
                class_id: r.get(3)?,
                name: r.get(4)?,
                student_no: r.get(5)?,
            })
        },
    )
    .optional()
}

impl ScopedRecord for Exam {
    const TABLE: &'static str = "exams";

    fn id(&self) -> &str {
        &self.id
    }

    fn load(conn: &Connection, school_id: &str) -> rusqlite::Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, school_id, semester_id, name, date FROM exams
             WHERE school_id = ? ORDER BY sort_order, rowid",
        )?;
        let rows = stmt
            .query_map([school_id], |r| {
                Ok(Exam {
                    id: r.get(0)?,
                    school_id: r.get(1)?,
                    semester_id: r.get(2)?,
                    name: r.get(3)?,
                    date: r.get(4)?,
                })
            })?
            .collect();
        rows
    }

    fn upsert(&self, conn: &Connection, school_id: &str, sort_order: i64) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO exams(id, school_id, semester_id, name, date, sort_order)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               semester_id = excluded.semester_id,
               name = excluded.name,
               date = excluded.date,
               sort_order = excluded.sort_order
             WHERE exams.school_id = excluded.school_id",
            (
                &self.id,
                school_id,
                &self.semester_id,
                &self.name,
                &self.date,
                sort_order,
            ),
        )?;
        Ok(())
    }

    fn remove(conn: &Connection, id: &str) -> rusqlite::Result<()> {
        conn.execute(
            "DELETE FROM subject_scores
             WHERE record_id IN (SELECT id FROM grade_records WHERE exam_id = ?)",
            [id],
        )?;
        conn.execute("DELETE FROM grade_records WHERE exam_id = ?", [id])?;
        conn.execute("DELETE FROM exams WHERE id = ?", [id])?;
        Ok(())
    }
}

fn write_subject_scores(
    conn: &Connection,
    record_id: &str,
    grades: &[SubjectGrade],
) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM subject_scores WHERE record_id = ?", [record_id])?;
    let mut stmt = conn.prepare(
        "INSERT INTO subject_scores(record_id, position, subject, score, full_score)
         VALUES(?, ?, ?, ?, ?)",
    )?;
    for (pos, g) in grades.iter().enumerate() {
        stmt.execute((record_id, pos as i64, &g.subject, g.score, g.full_score))?;
    }
    Ok(())
}

impl ScopedRecord for GradeRecord {
    const TABLE: &'static str = "grade_records";

    fn id(&self) -> &str {
        &self.id
    }

    fn load(conn: &Connection, school_id: &str) -> rusqlite::Result<Vec<Self>> {
        let mut grades_by_record: HashMap<String, Vec<SubjectGrade>> = HashMap::new();
        let mut grade_stmt = conn.prepare(
            "SELECT ss.record_id, ss.subject, ss.score, ss.full_score
             FROM subject_scores ss
             JOIN grade_records r ON r.id = ss.record_id
             WHERE r.school_id = ?
             ORDER BY ss.record_id, ss.position",
        )?;
        let mut rows = grade_stmt.query([school_id])?;
        while let Some(row) = rows.next()? {
            let record_id: String = row.get(0)?;
            grades_by_record
                .entry(record_id)
                .or_default()
                .push(SubjectGrade {
                    subject: row.get(1)?,
                    score: row.get(2)?,
                    full_score: row.get(3)?,
                });
        }

        let mut stmt = conn.prepare(
            "SELECT id, student_id, exam_id, school_id FROM grade_records
             WHERE school_id = ? ORDER BY sort_order, rowid",
        )?;
        let records = stmt
            .query_map([school_id], |r| {
                let id: String = r.get(0)?;
                Ok(GradeRecord {
                    grades: Vec::new(),
                    student_id: r.get(1)?,
                    exam_id: r.get(2)?,
                    school_id: r.get(3)?,
                    id,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records
            .into_iter()
            .map(|mut rec| {
                rec.grades = grades_by_record.remove(&rec.id).unwrap_or_default();
                rec
            })
            .collect())
    }

    fn upsert(&self, conn: &Connection, school_id: &str, sort_order: i64) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO grade_records(id, school_id, student_id, exam_id, sort_order)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               student_id = excluded.student_id,
               exam_id = excluded.exam_id,
               sort_order = excluded.sort_order
             WHERE grade_records.school_id = excluded.school_id",
            (
                &self.id,
                school_id,
                &self.student_id,
                &self.exam_id,
                sort_order,
            ),
        )?;
        write_subject_scores(conn, &self.id, &self.grades)
    }

    fn remove(conn: &Connection, id: &str) -> rusqlite::Result<()> {
        conn.execute("DELETE FROM subject_scores WHERE record_id = ?", [id])?;
        conn.execute("DELETE FROM grade_records WHERE id = ?", [id])?;
        Ok(())
    }
}

/// Appends new records after the existing ones without rewriting them.
/// Same end state as `save` with `existing ++ records`.
pub fn append_grade_records(
    conn: &Connection,
    school_id: &str,
    records: &[GradeRecord],
) -> rusqlite::Result<()> {
    let start = next_sort_order(conn, GradeRecord::TABLE, school_id)?;
    for (i, rec) in records.iter().enumerate() {
        rec.upsert(conn, school_id, start + i as i64)?;
    }
    Ok(())
}

/// Rewrites one record's subject scores, leaving its position alone.
pub fn update_record_grades(conn: &Connection, record: &GradeRecord) -> rusqlite::Result<()> {
    write_subject_scores(conn, &record.id, &record.grades)
}

impl ScopedRecord for Invitation {
    const TABLE: &'static str = "invitations";

    fn id(&self) -> &str {
        &self.id
    }

    fn load(conn: &Connection, school_id: &str) -> rusqlite::Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, school_id, grade_id, code, created_at FROM invitations
             WHERE school_id = ? ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map([school_id], invitation_from_row)?.collect();
        rows
    }

    fn upsert(&self, conn: &Connection, school_id: &str, _sort_order: i64) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO invitations(id, school_id, grade_id, code, created_at)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               grade_id = excluded.grade_id,
               code = excluded.code
             WHERE invitations.school_id = excluded.school_id",
            (
                &self.id,
                school_id,
                &self.grade_id,
                &self.code,
                &self.created_at,
            ),
        )?;
        Ok(())
    }
}

fn invitation_from_row(r: &Row) -> rusqlite::Result<Invitation> {
    Ok(Invitation {
        id: r.get(0)?,
        school_id: r.get(1)?,
        grade_id: r.get(2)?,
        code: r.get(3)?,
        created_at: r.get(4)?,
    })
}

pub fn invitation_by_code(conn: &Connection, code: &str) -> rusqlite::Result<Option<Invitation>> {
    conn.query_row(
        "SELECT id, school_id, grade_id, code, created_at FROM invitations WHERE code = ?",
        [code],
        invitation_from_row,
    )
    .optional()
}

// ---------------------------------------------------------------------------
// Unscoped collections
// ---------------------------------------------------------------------------

fn school_from_row(r: &Row) -> rusqlite::Result<School> {
    Ok(School {
        id: r.get(0)?,
        name: r.get(1)?,
        logo: r.get(2)?,
        motto: r.get(3)?,
        address: r.get(4)?,
        phone: r.get(5)?,
        website: r.get(6)?,
    })
}

pub fn schools(conn: &Connection) -> rusqlite::Result<Vec<School>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, logo, motto, address, phone, website FROM schools ORDER BY rowid",
    )?;
    let rows = stmt.query_map([], school_from_row)?.collect();
    rows
}

pub fn school_by_id(conn: &Connection, id: &str) -> rusqlite::Result<Option<School>> {
    conn.query_row(
        "SELECT id, name, logo, motto, address, phone, website FROM schools WHERE id = ?",
        [id],
        school_from_row,
    )
    .optional()
}

pub fn upsert_school(conn: &Connection, school: &School) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO schools(id, name, logo, motto, address, phone, website)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           logo = excluded.logo,
           motto = excluded.motto,
           address = excluded.address,
           phone = excluded.phone,
           website = excluded.website",
        (
            &school.id,
            &school.name,
            &school.logo,
            &school.motto,
            &school.address,
            &school.phone,
            &school.website,
        ),
    )?;
    Ok(())
}

const USER_COLUMNS: &str =
    "id, username, password_hash, role, school_id, real_name, gender, subjects_json";

fn user_from_row(r: &Row) -> rusqlite::Result<User> {
    let role: String = r.get(3)?;
    let gender: Option<String> = r.get(6)?;
    let subjects_json: String = r.get(7)?;
    Ok(User {
        id: r.get(0)?,
        username: r.get(1)?,
        password_hash: r.get(2)?,
        role: Role::parse(&role).unwrap_or(Role::Parent),
        school_id: r.get(4)?,
        child_ids: Vec::new(),
        real_name: r.get(5)?,
        gender: gender.as_deref().and_then(Gender::parse),
        subjects: serde_json::from_str(&subjects_json).unwrap_or_default(),
    })
}

fn load_child_ids(conn: &Connection, user: &mut User) -> rusqlite::Result<()> {
    if user.role != Role::Parent {
        return Ok(());
    }
    let mut stmt = conn.prepare(
        "SELECT student_id FROM parent_children WHERE parent_id = ? ORDER BY sort_order",
    )?;
    user.child_ids = stmt
        .query_map([&user.id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(())
}

pub fn users(conn: &Connection) -> rusqlite::Result<Vec<User>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM users ORDER BY rowid",
        USER_COLUMNS
    ))?;
    let mut all = stmt
        .query_map([], user_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for u in all.iter_mut() {
        load_child_ids(conn, u)?;
    }
    Ok(all)
}

pub fn user_by_id(conn: &Connection, id: &str) -> rusqlite::Result<Option<User>> {
    let user = conn
        .query_row(
            &format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS),
            [id],
            user_from_row,
        )
        .optional()?;
    match user {
        Some(mut u) => {
            load_child_ids(conn, &mut u)?;
            Ok(Some(u))
        }
        None => Ok(None),
    }
}

pub fn user_by_username(conn: &Connection, username: &str) -> rusqlite::Result<Option<User>> {
    let user = conn
        .query_row(
            &format!("SELECT {} FROM users WHERE username = ?", USER_COLUMNS),
            [username],
            user_from_row,
        )
        .optional()?;
    match user {
        Some(mut u) => {
            load_child_ids(conn, &mut u)?;
            Ok(Some(u))
        }
        None => Ok(None),
    }
}

pub fn upsert_user(conn: &Connection, user: &User) -> rusqlite::Result<()> {
    let subjects_json = serde_json::to_string(&user.subjects).unwrap_or_else(|_| "[]".into());
    conn.execute(
        "INSERT INTO users(id, username, password_hash, role, school_id, real_name, gender, subjects_json)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           username = excluded.username,
           password_hash = excluded.password_hash,
           role = excluded.role,
           school_id = excluded.school_id,
           real_name = excluded.real_name,
           gender = excluded.gender,
           subjects_json = excluded.subjects_json",
        (
            &user.id,
            &user.username,
            &user.password_hash,
            user.role.as_str(),
            &user.school_id,
            &user.real_name,
            user.gender.map(|g| g.as_str()),
            &subjects_json,
        ),
    )?;

    conn.execute("DELETE FROM parent_children WHERE parent_id = ?", [&user.id])?;
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO parent_children(parent_id, student_id, sort_order) VALUES(?, ?, ?)",
    )?;
    for (i, sid) in user.child_ids.iter().enumerate() {
        stmt.execute((&user.id, sid, i as i64))?;
    }
    Ok(())
}

pub fn delete_user(conn: &Connection, id: &str) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM parent_children WHERE parent_id = ?", [id])?;
    conn.execute("DELETE FROM users WHERE id = ?", [id])?;
    Ok(())
}
