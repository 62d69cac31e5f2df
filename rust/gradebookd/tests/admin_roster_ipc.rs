
use serde_json::json;
use test_support::{request_err, request_ok, setup_school, spawn_sidecar, str_at, temp_dir};

#[test]
fn grade_class_student_lifecycle_with_guards() {
    let workspace = temp_dir("gradebook-admin-roster");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin, _school, _semester) = setup_school(&mut stdin, &mut reader, &workspace);

    let grade = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "gradeLevels.create",
        json!({ "actorId": admin, "name": "Grade 7" }),
    );
    let grade_id = str_at(&grade, "/gradeLevel/id").to_string();
    let dup = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "gradeLevels.create",
        json!({ "actorId": admin, "name": "Grade 7" }),
    );
    assert_eq!(dup, "conflict");

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "actorId": admin, "gradeId": grade_id, "name": "Class A" }),
    );
    let class_id = str_at(&class, "/class/id").to_string();

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "actorId": admin, "classId": class_id, "name": "Chen Yi", "studentNo": "7001" }),
    );
    let student_id = str_at(&student, "/student/id").to_string();
    assert_eq!(str_at(&student, "/student/gradeId"), grade_id);
    let dup_no = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({ "actorId": admin, "classId": class_id, "name": "Other", "studentNo": "7001" }),
    );
    assert_eq!(dup_no, "conflict");

    // Guards: a grade with classes and a class with students stay.
    let grade_busy = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "gradeLevels.delete",
        json!({ "actorId": admin, "gradeId": grade_id }),
    );
    assert_eq!(grade_busy, "conflict");
    let class_busy = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "classes.delete",
        json!({ "actorId": admin, "classId": class_id }),
    );
    assert_eq!(class_busy, "conflict");

    // Moving a class to another grade moves its students.
    let grade8 = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "gradeLevels.create",
        json!({ "actorId": admin, "name": "Grade 8" }),
    );
    let grade8_id = str_at(&grade8, "/gradeLevel/id").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "classes.update",
        json!({ "actorId": admin, "classId": class_id, "gradeId": grade8_id }),
    );
    let students = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.list",
        json!({ "actorId": admin, "gradeId": grade8_id }),
    );
    assert_eq!(students["students"][0]["id"], json!(student_id));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "students.delete",
        json!({ "actorId": admin, "studentId": student_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "classes.delete",
        json!({ "actorId": admin, "classId": class_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "gradeLevels.delete",
        json!({ "actorId": admin, "gradeId": grade_id }),
    );
    let grades = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "gradeLevels.list",
        json!({ "actorId": admin }),
    );
    assert_eq!(grades["gradeLevels"].as_array().map(|a| a.len()), Some(1));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn semesters_keep_exactly_one_current() {
    let workspace = temp_dir("gradebook-admin-semesters");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin, _school, first) = setup_school(&mut stdin, &mut reader, &workspace);

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "semesters.create",
        json!({ "actorId": admin, "name": "2025 Spring" }),
    );
    assert_eq!(second["semester"]["isCurrent"], json!(false));
    let second_id = str_at(&second, "/semester/id").to_string();

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "semesters.setCurrent",
        json!({ "actorId": admin, "semesterId": second_id }),
    );
    let semesters = listed["semesters"].as_array().expect("semesters");
    let current: Vec<&str> = semesters
        .iter()
        .filter(|s| s["isCurrent"] == json!(true))
        .map(|s| s["id"].as_str().expect("id"))
        .collect();
    assert_eq!(current, vec![second_id.as_str()]);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "exams.create",
        json!({ "actorId": admin, "semesterId": first, "name": "Quiz", "date": "2024-10-01" }),
    );
    let busy = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "semesters.delete",
        json!({ "actorId": admin, "semesterId": first }),
    );
    assert_eq!(busy, "conflict");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn exam_delete_cascades_only_its_records_and_stats_round() {
    let workspace = temp_dir("gradebook-admin-exams");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin, _school, semester) = setup_school(&mut stdin, &mut reader, &workspace);

    let rows = json!([
        { "studentNo": "1", "name": "A", "grade": "G1", "class": "C1", "math": 90, "english": 80 },
        { "studentNo": "2", "name": "B", "grade": "G1", "class": "C1", "math": 85 },
        { "studentNo": "3", "name": "C", "grade": "G1", "class": "C1", "math": 86 }
    ]);
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.scores",
        json!({ "actorId": admin, "examName": "E1", "semesterId": semester, "rows": rows }),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "import.scores",
        json!({ "actorId": admin, "examName": "E2", "semesterId": semester, "rows": rows }),
    );
    let first_id = str_at(&first, "/exam/id").to_string();
    let second_id = str_at(&second, "/exam/id").to_string();

    let stats = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "exams.stats",
        json!({ "actorId": admin, "examId": first_id }),
    );
    assert_eq!(stats["studentCount"], json!(3));
    assert_eq!(stats["subjects"][0]["subject"], json!("math"));
    assert_eq!(stats["subjects"][0]["avg"], json!(87.0));
    assert_eq!(stats["subjects"][0]["max"], json!(90.0));
    assert_eq!(stats["subjects"][0]["min"], json!(85.0));
    assert_eq!(stats["subjects"][1]["subject"], json!("english"));
    assert_eq!(stats["subjects"][1]["count"], json!(1));

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "exams.delete",
        json!({ "actorId": admin, "examId": first_id }),
    );
    assert_eq!(deleted["removedRecords"], json!(3));

    let gone = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "scores.list",
        json!({ "actorId": admin, "examId": first_id }),
    );
    assert_eq!(gone, "not_found");
    let kept = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "scores.list",
        json!({ "actorId": admin, "examId": second_id }),
    );
    assert_eq!(kept["rows"].as_array().map(|a| a.len()), Some(3));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn score_edits_validate_range_and_respect_teacher_scope() {
    let workspace = temp_dir("gradebook-admin-scores");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin, _school, semester) = setup_school(&mut stdin, &mut reader, &workspace);

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.scores",
        json!({
            "actorId": admin,
            "examName": "E1",
            "semesterId": semester,
            "rows": [{ "studentNo": "1", "name": "A", "grade": "G1", "class": "C1", "math": 90 }]
        }),
    );
    let exam_id = str_at(&imported, "/exam/id").to_string();
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "scores.list",
        json!({ "actorId": admin, "examId": exam_id }),
    );
    let record_id = str_at(&listed, "/rows/0/record/id").to_string();

    let too_high = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "scores.update",
        json!({ "actorId": admin, "recordId": record_id, "subject": "math", "score": 101 }),
    );
    assert_eq!(too_high, "bad_params");

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "scores.update",
        json!({ "actorId": admin, "recordId": record_id, "subject": "physics", "score": 70 }),
    );
    assert_eq!(updated["total"], json!(160.0));

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "teachers.create",
        json!({ "actorId": admin, "username": "t1", "password": "pw", "realName": "T One" }),
    );
    let teacher_id = str_at(&teacher, "/teacher/id").to_string();
    let hidden = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "scores.list",
        json!({ "actorId": teacher_id, "examId": exam_id }),
    );
    assert_eq!(hidden["rows"], json!([]));
    let denied = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "scores.update",
        json!({ "actorId": teacher_id, "recordId": record_id, "subject": "math", "score": 50 }),
    );
    assert_eq!(denied, "forbidden");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn teacher_delete_clears_class_assignments() {
    let workspace = temp_dir("gradebook-admin-teachers");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin, _school, _semester) = setup_school(&mut stdin, &mut reader, &workspace);

    let grade = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "gradeLevels.create",
        json!({ "actorId": admin, "name": "Grade 7" }),
    );
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({
            "actorId": admin,
            "username": "t1",
            "password": "pw",
            "realName": "T One",
            "gender": "FEMALE",
            "subjects": ["math", "physics"]
        }),
    );
    let teacher_id = str_at(&teacher, "/teacher/id").to_string();
    assert!(teacher["teacher"].get("passwordHash").is_none());

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({
            "actorId": admin,
            "gradeId": str_at(&grade, "/gradeLevel/id"),
            "name": "Class A",
            "classTeacherId": teacher_id,
            "subjectTeachers": { "math": teacher_id }
        }),
    );
    let class_id = str_at(&class, "/class/id").to_string();

    let taught = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.classes",
        json!({ "actorId": teacher_id }),
    );
    assert_eq!(taught["classes"].as_array().map(|a| a.len()), Some(1));

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "teachers.delete",
        json!({ "actorId": admin, "teacherId": teacher_id }),
    );
    assert_eq!(deleted["classesCleared"], json!(1));

    let classes = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "classes.list",
        json!({ "actorId": admin }),
    );
    let c = &classes["classes"][0];
    assert_eq!(c["id"], json!(class_id));
    assert!(c.get("classTeacherId").map_or(true, |v| v.is_null()));
    assert_eq!(c["subjectTeachers"], json!({}));

    let _ = std::fs::remove_dir_all(workspace);
}
