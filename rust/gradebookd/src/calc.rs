use crate::model::{Exam, GradeRecord};
use serde::Serialize;
use std::collections::BTreeMap;

/// Half-up rounding to a whole number.
pub fn round_half_up(x: f64) -> f64 {
    (x + 0.5).floor()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStats {
    pub subject: String,
    pub avg: f64,
    pub max: f64,
    pub min: f64,
    pub count: usize,
}

/// Per-subject statistics over one exam's records, in order of first
/// appearance. `None` when the exam has no records.
pub fn exam_stats<'a, I>(records: I) -> Option<Vec<SubjectStats>>
where
    I: IntoIterator<Item = &'a GradeRecord>,
{
    struct Acc {
        total: f64,
        count: usize,
        max: f64,
        min: f64,
    }

    let mut order: Vec<String> = Vec::new();
    let mut acc: BTreeMap<String, Acc> = BTreeMap::new();
    let mut any = false;

    for rec in records {
        any = true;
        for g in &rec.grades {
            let e = acc.entry(g.subject.clone()).or_insert_with(|| {
                order.push(g.subject.clone());
                Acc {
                    total: 0.0,
                    count: 0,
                    max: f64::NEG_INFINITY,
                    min: f64::INFINITY,
                }
            });
            e.total += g.score;
            e.count += 1;
            e.max = e.max.max(g.score);
            e.min = e.min.min(g.score);
        }
    }
    if !any {
        return None;
    }

    Some(
        order
            .into_iter()
            .filter_map(|subject| {
                let a = acc.remove(&subject)?;
                Some(SubjectStats {
                    avg: round_half_up(a.total / a.count as f64),
                    max: a.max,
                    min: a.min,
                    count: a.count,
                    subject,
                })
            })
            .collect(),
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub exam_id: String,
    pub exam_name: String,
    pub date: String,
    pub total: f64,
    /// Subject -> score as a whole percentage of its full score.
    pub percents: BTreeMap<String, f64>,
}

/// One point per record whose exam is known, oldest exam first.
pub fn trend_points(records: &[GradeRecord], exams: &[Exam]) -> Vec<TrendPoint> {
    let mut points: Vec<TrendPoint> = records
        .iter()
        .filter_map(|rec| {
            let exam = exams.iter().find(|e| e.id == rec.exam_id)?;
            let percents = rec
                .grades
                .iter()
                .filter(|g| g.full_score > 0.0)
                .map(|g| (g.subject.clone(), round_half_up(g.score / g.full_score * 100.0)))
                .collect();
            Some(TrendPoint {
                exam_id: exam.id.clone(),
                exam_name: exam.name.clone(),
                date: exam.date.clone(),
                total: rec.total(),
                percents,
            })
        })
        .collect();
    points.sort_by(|a, b| a.date.cmp(&b.date));
    points
}
