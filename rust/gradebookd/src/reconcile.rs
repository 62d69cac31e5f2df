//! Roster reconciliation for bulk score import.
//!
//! A batch of spreadsheet rows is matched against the school's grade levels,
//! classes and students. Missing grade levels, classes and students are created
//! for administrators; teachers can only write into roster entries that already
//! exist (and, when a permitted set is given, only into their own classes).
//! Every accepted row yields one grade record for the new exam.
//!
//! [`reconcile_rows`] is pure and never fails; row problems are counted as
//! skips. [`RosterBatch::finalize`] rejects a batch with no accepted rows and
//! otherwise stamps the records with a freshly created exam.

use crate::model::{Exam, GradeLevel, GradeRecord, SchoolClass, Student, SubjectGrade};
use crate::sheet::SheetRow;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

pub const UNASSIGNED_GRADE: &str = "Unassigned Grade";
pub const UNASSIGNED_CLASS: &str = "Unassigned Class";
pub const FULL_SCORE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Language,
    Math,
    English,
    Physics,
    Chemistry,
    Biology,
    History,
    Geography,
    Politics,
}

impl Subject {
    pub const ALL: [Subject; 9] = [
        Subject::Language,
        Subject::Math,
        Subject::English,
        Subject::Physics,
        Subject::Chemistry,
        Subject::Biology,
        Subject::History,
        Subject::Geography,
        Subject::Politics,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Subject::Language => "language",
            Subject::Math => "math",
            Subject::English => "english",
            Subject::Physics => "physics",
            Subject::Chemistry => "chemistry",
            Subject::Biology => "biology",
            Subject::History => "history",
            Subject::Geography => "geography",
            Subject::Politics => "politics",
        }
    }

    // Normalized header spellings (see `normalize_header`).
    fn aliases(self) -> &'static [&'static str] {
        match self {
            Subject::Language => &["language", "chinese", "语文"],
            Subject::Math => &["math", "maths", "mathematics", "数学"],
            Subject::English => &["english", "英语"],
            Subject::Physics => &["physics", "物理"],
            Subject::Chemistry => &["chemistry", "化学"],
            Subject::Biology => &["biology", "生物"],
            Subject::History => &["history", "历史"],
            Subject::Geography => &["geography", "地理"],
            Subject::Politics => &["politics", "政治"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Column {
    StudentNo,
    Name,
    Grade,
    Class,
    Score(Subject),
}

fn normalize_header(h: &str) -> String {
    h.chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

impl Column {
    fn from_header(header: &str) -> Option<Column> {
        let h = normalize_header(header);
        match h.as_str() {
            "studentno" | "studentnumber" | "studentid" | "学号" => Some(Column::StudentNo),
            "name" | "studentname" | "姓名" => Some(Column::Name),
            "grade" | "gradename" | "gradelevel" | "年级" => Some(Column::Grade),
            "class" | "classname" | "班级" => Some(Column::Class),
            _ => Subject::ALL
                .into_iter()
                .find(|s| s.aliases().contains(&h.as_str()))
                .map(Column::Score),
        }
    }
}

/// One spreadsheet row after header recognition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScoreRow {
    pub student_no: String,
    pub name: String,
    pub grade_name: Option<String>,
    pub class_name: Option<String>,
    /// Recognized subjects with a numeric value, in vocabulary order.
    pub scores: Vec<(Subject, f64)>,
}

impl ScoreRow {
    /// When several headers name the same column, the leftmost non-blank one wins.
    pub fn from_sheet_row(row: &SheetRow) -> ScoreRow {
        let mut cols: HashMap<Column, String> = HashMap::new();
        for (header, value) in row {
            let Some(col) = Column::from_header(header) else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            cols.entry(col).or_insert_with(|| value.to_string());
        }

        let scores = Subject::ALL
            .into_iter()
            .filter_map(|s| {
                let raw = cols.get(&Column::Score(s))?;
                let v = raw.parse::<f64>().ok().filter(|v| v.is_finite())?;
                Some((s, v))
            })
            .collect();

        ScoreRow {
            student_no: cols.remove(&Column::StudentNo).unwrap_or_default(),
            name: cols.remove(&Column::Name).unwrap_or_default(),
            grade_name: cols.remove(&Column::Grade),
            class_name: cols.remove(&Column::Class),
            scores,
        }
    }

    fn subject_grades(&self) -> Vec<SubjectGrade> {
        self.scores
            .iter()
            .map(|(s, v)| SubjectGrade {
                subject: s.name().to_string(),
                score: *v,
                full_score: FULL_SCORE,
            })
            .collect()
    }
}

/// Who is importing. Parents never reach the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Actor {
    Admin,
    Teacher {
        permitted_class_ids: Option<HashSet<String>>,
    },
}

impl Actor {
    fn may_extend_roster(&self) -> bool {
        matches!(self, Actor::Admin)
    }

    fn may_write_class(&self, class_id: &str) -> bool {
        match self {
            Actor::Admin => true,
            Actor::Teacher {
                permitted_class_ids: Some(ids),
            } => ids.contains(class_id),
            Actor::Teacher {
                permitted_class_ids: None,
            } => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingIdentity,
    UnknownGradeLevel,
    UnknownClass,
    ClassNotPermitted,
    UnknownStudent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub total: usize,
    pub imported: usize,
    pub skipped: usize,
    pub skip_reasons: BTreeMap<SkipReason, usize>,
    pub created_grade_levels: usize,
    pub created_classes: usize,
    pub created_students: usize,
    pub updated_students: usize,
}

impl ImportSummary {
    fn skip(&mut self, reason: SkipReason) {
        self.skipped += 1;
        *self.skip_reasons.entry(reason).or_insert(0) += 1;
    }
}

/// Current roster collections of one school.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub grade_levels: Vec<GradeLevel>,
    pub classes: Vec<SchoolClass>,
    pub students: Vec<Student>,
}

/// Result of row processing, before an exam exists.
#[derive(Debug, Clone)]
pub struct RosterBatch {
    pub school_id: String,
    pub grade_levels: Vec<GradeLevel>,
    pub classes: Vec<SchoolClass>,
    pub students: Vec<Student>,
    /// Grade records with an empty `exam_id`.
    pub records: Vec<GradeRecord>,
    pub summary: ImportSummary,
}

#[derive(Debug, Clone)]
pub struct ExamContext {
    pub name: String,
    pub semester_id: String,
    pub date: String,
}

/// Everything an accepted import writes.
#[derive(Debug, Clone)]
pub struct ImportPlan {
    pub grade_levels: Vec<GradeLevel>,
    pub classes: Vec<SchoolClass>,
    pub students: Vec<Student>,
    pub exam: Exam,
    pub records: Vec<GradeRecord>,
    pub summary: ImportSummary,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("no valid rows to import ({skipped} of {total} rows skipped)")]
    NoValidRows { total: usize, skipped: usize },
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn or_sentinel(v: &Option<String>, sentinel: &str) -> String {
    match v.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => sentinel.to_string(),
    }
}

pub fn reconcile_rows(
    school_id: &str,
    actor: &Actor,
    roster: Roster,
    rows: &[ScoreRow],
) -> RosterBatch {
    let Roster {
        mut grade_levels,
        mut classes,
        mut students,
    } = roster;
    let existing_students = students.len();
    let mut updated: HashSet<String> = HashSet::new();
    let mut records = Vec::new();
    let mut summary = ImportSummary {
        total: rows.len(),
        ..ImportSummary::default()
    };

    for row in rows {
        let student_no = row.student_no.trim();
        let name = row.name.trim();
        if student_no.is_empty() || name.is_empty() {
            summary.skip(SkipReason::MissingIdentity);
            continue;
        }

        let grade_name = or_sentinel(&row.grade_name, UNASSIGNED_GRADE);
        let grade_id = match grade_levels.iter().find(|g| g.name == grade_name) {
            Some(g) => g.id.clone(),
            None if actor.may_extend_roster() => {
                let g = GradeLevel {
                    id: new_id(),
                    school_id: school_id.to_string(),
                    name: grade_name,
                };
                let id = g.id.clone();
                grade_levels.push(g);
                summary.created_grade_levels += 1;
                id
            }
            None => {
                summary.skip(SkipReason::UnknownGradeLevel);
                continue;
            }
        };

        let class_name = or_sentinel(&row.class_name, UNASSIGNED_CLASS);
        let class_id = match classes
            .iter()
            .find(|c| c.name == class_name && c.grade_id == grade_id)
        {
            Some(c) => c.id.clone(),
            None if actor.may_extend_roster() => {
                let c = SchoolClass {
                    id: new_id(),
                    school_id: school_id.to_string(),
                    grade_id: grade_id.clone(),
                    name: class_name,
                    class_teacher_id: None,
                    subject_teachers: BTreeMap::new(),
                };
                let id = c.id.clone();
                classes.push(c);
                summary.created_classes += 1;
                id
            }
            None => {
                summary.skip(SkipReason::UnknownClass);
                continue;
            }
        };

        if !actor.may_write_class(&class_id) {
            summary.skip(SkipReason::ClassNotPermitted);
            continue;
        }

        let student_id = match students.iter().position(|s| s.student_no == student_no) {
            Some(idx) => {
                let s = &mut students[idx];
                // The row's class is not enough; the student must sit in a writable class.
                if !actor.may_write_class(&s.class_id) {
                    summary.skip(SkipReason::ClassNotPermitted);
                    continue;
                }
                if actor.may_extend_roster() {
                    let changed =
                        s.name != name || s.grade_id != grade_id || s.class_id != class_id;
                    s.name = name.to_string();
                    s.grade_id = grade_id.clone();
                    s.class_id = class_id.clone();
                    if changed && idx < existing_students {
                        updated.insert(s.id.clone());
                    }
                }
                s.id.clone()
            }
            None if actor.may_extend_roster() => {
                let s = Student {
                    id: new_id(),
                    school_id: school_id.to_string(),
                    grade_id: grade_id.clone(),
                    class_id: class_id.clone(),
                    name: name.to_string(),
                    student_no: student_no.to_string(),
                };
                let id = s.id.clone();
                students.push(s);
                summary.created_students += 1;
                id
            }
            None => {
                summary.skip(SkipReason::UnknownStudent);
                continue;
            }
        };

        records.push(GradeRecord {
            id: new_id(),
            student_id,
            exam_id: String::new(),
            school_id: school_id.to_string(),
            grades: row.subject_grades(),
        });
        summary.imported += 1;
    }

    summary.updated_students = updated.len();

    RosterBatch {
        school_id: school_id.to_string(),
        grade_levels,
        classes,
        students,
        records,
        summary,
    }
}

impl RosterBatch {
    pub fn finalize(self, exam: ExamContext) -> Result<ImportPlan, ImportError> {
        if self.summary.imported == 0 {
            return Err(ImportError::NoValidRows {
                total: self.summary.total,
                skipped: self.summary.skipped,
            });
        }

        let exam = Exam {
            id: new_id(),
            school_id: self.school_id.clone(),
            semester_id: exam.semester_id,
            name: exam.name,
            date: exam.date,
        };
        let records = self
            .records
            .into_iter()
            .map(|mut r| {
                r.exam_id = exam.id.clone();
                r
            })
            .collect();

        Ok(ImportPlan {
            grade_levels: self.grade_levels,
            classes: self.classes,
            students: self.students,
            exam,
            records,
            summary: self.summary,
        })
    }
}
