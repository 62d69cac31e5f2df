
use serde_json::{json, Value};
use test_support::{request_err, request_ok, setup_school, spawn_sidecar, str_at, temp_dir};

fn zhang_san_row() -> Value {
    json!({
        "studentNo": "2024001",
        "name": "Zhang San",
        "grade": "Grade 9",
        "class": "Class 1",
        "math": 95,
        "english": 88
    })
}

#[test]
fn admin_import_into_empty_school_creates_roster_and_record() {
    let workspace = temp_dir("gradebook-import-a");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin, _school, semester) = setup_school(&mut stdin, &mut reader, &workspace);

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.scores",
        json!({
            "actorId": admin,
            "examName": "Midterm",
            "semesterId": semester,
            "examDate": "2024-11-05",
            "rows": [zhang_san_row()]
        }),
    );
    assert_eq!(imported["summary"]["total"], json!(1));
    assert_eq!(imported["summary"]["imported"], json!(1));
    assert_eq!(imported["summary"]["createdGradeLevels"], json!(1));
    assert_eq!(imported["summary"]["createdClasses"], json!(1));
    assert_eq!(imported["summary"]["createdStudents"], json!(1));
    let exam_id = str_at(&imported, "/exam/id").to_string();
    assert_eq!(str_at(&imported, "/exam/date"), "2024-11-05");

    let grades = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "gradeLevels.list",
        json!({ "actorId": admin }),
    );
    assert_eq!(grades["gradeLevels"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(grades["gradeLevels"][0]["name"], json!("Grade 9"));

    let classes = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.list",
        json!({ "actorId": admin }),
    );
    assert_eq!(classes["classes"][0]["name"], json!("Class 1"));
    assert_eq!(classes["classes"][0]["gradeId"], grades["gradeLevels"][0]["id"]);

    let scores = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "scores.list",
        json!({ "actorId": admin, "examId": exam_id }),
    );
    let rows = scores["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["student"]["name"], json!("Zhang San"));
    assert_eq!(rows[0]["student"]["studentNo"], json!("2024001"));
    assert_eq!(
        rows[0]["record"]["grades"],
        json!([
            { "subject": "math", "score": 95.0, "fullScore": 100.0 },
            { "subject": "english", "score": 88.0, "fullScore": 100.0 }
        ])
    );
    assert_eq!(rows[0]["total"], json!(183.0));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn teacher_without_classes_is_rejected_and_nothing_is_written() {
    let workspace = temp_dir("gradebook-import-b");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin, _school, semester) = setup_school(&mut stdin, &mut reader, &workspace);

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "teachers.create",
        json!({
            "actorId": admin,
            "username": "li.teacher",
            "password": "secret",
            "realName": "Li Ming",
            "subjects": ["math"]
        }),
    );
    let teacher_id = str_at(&teacher, "/teacher/id").to_string();

    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "import.scores",
        json!({
            "actorId": teacher_id,
            "examName": "Midterm",
            "semesterId": semester,
            "rows": [zhang_san_row()]
        }),
    );
    assert_eq!(code, "import_no_valid_rows");

    let grades = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "gradeLevels.list",
        json!({ "actorId": admin }),
    );
    assert_eq!(grades["gradeLevels"], json!([]));
    let exams = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "exams.list",
        json!({ "actorId": admin }),
    );
    assert_eq!(exams["exams"], json!([]));
    let students = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.list",
        json!({ "actorId": admin }),
    );
    assert_eq!(students["students"], json!([]));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn duplicate_student_numbers_last_name_wins_with_one_record_per_row() {
    let workspace = temp_dir("gradebook-import-c");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin, _school, semester) = setup_school(&mut stdin, &mut reader, &workspace);

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.scores",
        json!({
            "actorId": admin,
            "examName": "Quiz",
            "semesterId": semester,
            "rows": [
                { "studentNo": "2024001", "name": "Zhang San", "grade": "Grade 9", "class": "Class 1", "math": 70 },
                { "studentNo": "2024001", "name": "Zhang Sanfeng", "grade": "Grade 9", "class": "Class 1", "math": 75 }
            ]
        }),
    );
    assert_eq!(imported["summary"]["imported"], json!(2));
    assert_eq!(imported["summary"]["createdStudents"], json!(1));
    let exam_id = str_at(&imported, "/exam/id").to_string();

    let students = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.list",
        json!({ "actorId": admin }),
    );
    let list = students["students"].as_array().expect("students");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["name"], json!("Zhang Sanfeng"));
    let student_id = list[0]["id"].clone();

    let scores = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "scores.list",
        json!({ "actorId": admin, "examId": exam_id }),
    );
    let rows = scores["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r["record"]["studentId"] == student_id));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn reimport_keeps_student_identity_and_omits_blank_subjects() {
    let workspace = temp_dir("gradebook-import-reimport");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin, _school, semester) = setup_school(&mut stdin, &mut reader, &workspace);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.scores",
        json!({
            "actorId": admin,
            "examName": "Midterm",
            "semesterId": semester,
            "examDate": "2024-11-05",
            "rows": [zhang_san_row()]
        }),
    );
    let students = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.list",
        json!({ "actorId": admin }),
    );
    let original_id = students["students"][0]["id"].clone();

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "import.scores",
        json!({
            "actorId": admin,
            "examName": "Final",
            "semesterId": semester,
            "examDate": "2025-01-10",
            "rows": [{
                "studentNo": "2024001",
                "name": "Zhang San",
                "grade": "Grade 9",
                "class": "Class 1",
                "math": 91,
                "english": ""
            }]
        }),
    );
    assert_eq!(second["summary"]["createdStudents"], json!(0));
    assert_eq!(second["summary"]["createdGradeLevels"], json!(0));
    assert_ne!(first["exam"]["id"], second["exam"]["id"]);

    let students = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.list",
        json!({ "actorId": admin }),
    );
    assert_eq!(students["students"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(students["students"][0]["id"], original_id);

    let scores = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "scores.list",
        json!({ "actorId": admin, "examId": str_at(&second, "/exam/id") }),
    );
    assert_eq!(scores["rows"][0]["record"]["studentId"], original_id);
    assert_eq!(
        scores["rows"][0]["record"]["grades"],
        json!([{ "subject": "math", "score": 91.0, "fullScore": 100.0 }])
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn teacher_import_uses_own_classes_and_never_creates() {
    let workspace = temp_dir("gradebook-import-teacher");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin, _school, semester) = setup_school(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.scores",
        json!({
            "actorId": admin,
            "examName": "Baseline",
            "semesterId": semester,
            "rows": [
                zhang_san_row(),
                { "studentNo": "2024002", "name": "Wang Wu", "grade": "Grade 9", "class": "Class 2", "math": 60 }
            ]
        }),
    );
    let classes = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.list",
        json!({ "actorId": admin }),
    );
    let class_one = classes["classes"]
        .as_array()
        .expect("classes")
        .iter()
        .find(|c| c["name"] == json!("Class 1"))
        .expect("class 1")["id"]
        .as_str()
        .expect("id")
        .to_string();

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.create",
        json!({
            "actorId": admin,
            "username": "li.teacher",
            "password": "secret",
            "realName": "Li Ming",
            "subjects": ["math"]
        }),
    );
    let teacher_id = str_at(&teacher, "/teacher/id").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.update",
        json!({ "actorId": admin, "classId": class_one, "classTeacherId": teacher_id }),
    );

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "import.scores",
        json!({
            "actorId": teacher_id,
            "examName": "Unit test",
            "semesterId": semester,
            "rows": [
                { "studentNo": "2024001", "name": "Renamed", "grade": "Grade 9", "class": "Class 1", "math": 99 },
                { "studentNo": "2024002", "name": "Wang Wu", "grade": "Grade 9", "class": "Class 2", "math": 61 },
                { "studentNo": "2024003", "name": "Zhao Liu", "grade": "Grade 9", "class": "Class 1", "math": 80 },
                { "studentNo": "2024004", "name": "Sun Qi", "grade": "Grade 10", "class": "Class 1", "math": 80 },
                { "studentNo": "", "name": "Nobody", "math": 10 }
            ]
        }),
    );
    let summary = &imported["summary"];
    assert_eq!(summary["total"], json!(5));
    assert_eq!(summary["imported"], json!(1));
    assert_eq!(summary["skipped"], json!(4));
    assert_eq!(summary["skipReasons"]["class_not_permitted"], json!(1));
    assert_eq!(summary["skipReasons"]["unknown_student"], json!(1));
    assert_eq!(summary["skipReasons"]["unknown_grade_level"], json!(1));
    assert_eq!(summary["skipReasons"]["missing_identity"], json!(1));
    assert_eq!(summary["createdStudents"], json!(0));
    assert_eq!(summary["updatedStudents"], json!(0));

    // Teachers reuse students unchanged.
    let students = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.list",
        json!({ "actorId": admin, "query": "2024001" }),
    );
    assert_eq!(students["students"][0]["name"], json!("Zhang San"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn teacher_cannot_score_another_class_student_under_own_class_name() {
    let workspace = temp_dir("gradebook-import-cross-class");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin, _school, semester) = setup_school(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.scores",
        json!({
            "actorId": admin,
            "examName": "Baseline",
            "semesterId": semester,
            "rows": [
                zhang_san_row(),
                { "studentNo": "2024002", "name": "Wang Wu", "grade": "Grade 9", "class": "Class 2", "math": 60 }
            ]
        }),
    );
    let classes = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.list",
        json!({ "actorId": admin }),
    );
    let class_id = |name: &str| -> String {
        classes["classes"]
            .as_array()
            .expect("classes")
            .iter()
            .find(|c| c["name"] == json!(name))
            .expect("class")["id"]
            .as_str()
            .expect("id")
            .to_string()
    };
    let class_one = class_id("Class 1");
    let class_two = class_id("Class 2");

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.create",
        json!({
            "actorId": admin,
            "username": "li.teacher",
            "password": "secret",
            "realName": "Li Ming",
            "subjects": ["math"]
        }),
    );
    let teacher_id = str_at(&teacher, "/teacher/id").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.update",
        json!({ "actorId": admin, "classId": class_one, "classTeacherId": teacher_id }),
    );

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "import.scores",
        json!({
            "actorId": teacher_id,
            "examName": "Quiz",
            "semesterId": semester,
            "rows": [
                { "studentNo": "2024001", "name": "Zhang San", "grade": "Grade 9", "class": "Class 1", "math": 90 },
                { "studentNo": "2024002", "name": "Wang Wu", "grade": "Grade 9", "class": "Class 1", "math": 100 }
            ]
        }),
    );
    assert_eq!(imported["summary"]["imported"], json!(1));
    assert_eq!(imported["summary"]["skipReasons"]["class_not_permitted"], json!(1));

    let scores = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "scores.list",
        json!({ "actorId": admin, "examId": str_at(&imported, "/exam/id") }),
    );
    let rows = scores["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["student"]["studentNo"], json!("2024001"));

    let students = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.list",
        json!({ "actorId": admin, "query": "2024002" }),
    );
    assert_eq!(students["students"][0]["classId"], json!(class_two));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn preview_reports_without_writing() {
    let workspace = temp_dir("gradebook-import-preview");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin, _school, _semester) = setup_school(&mut stdin, &mut reader, &workspace);

    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.preview",
        json!({ "actorId": admin, "rows": [zhang_san_row()] }),
    );
    assert_eq!(preview["summary"]["imported"], json!(1));
    assert_eq!(preview["newGradeLevels"], json!(["Grade 9"]));
    assert_eq!(preview["newClasses"], json!([{ "grade": "Grade 9", "name": "Class 1" }]));
    assert_eq!(
        preview["newStudents"],
        json!([{ "studentNo": "2024001", "name": "Zhang San" }])
    );

    let grades = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "gradeLevels.list",
        json!({ "actorId": admin }),
    );
    assert_eq!(grades["gradeLevels"], json!([]));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn csv_file_import_and_unreadable_file() {
    let workspace = temp_dir("gradebook-import-csv");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin, _school, semester) = setup_school(&mut stdin, &mut reader, &workspace);

    let csv_path = workspace.join("scores.csv");
    std::fs::write(
        &csv_path,
        "学号,姓名,年级,班级,数学,英语\n2024001,张三,初三,1班,95,88\n2024002,李四,初三,1班,72,\n",
    )
    .expect("write csv");

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.scores",
        json!({
            "actorId": admin,
            "examName": "期中考试",
            "semesterId": semester,
            "filePath": csv_path.to_string_lossy()
        }),
    );
    assert_eq!(imported["summary"]["imported"], json!(2));
    assert_eq!(imported["summary"]["createdStudents"], json!(2));

    let missing = workspace.join("missing.xlsx");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "import.scores",
        json!({
            "actorId": admin,
            "examName": "Broken",
            "semesterId": semester,
            "filePath": missing.to_string_lossy()
        }),
    );
    assert_eq!(code, "import_unreadable");

    let exams = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "exams.list",
        json!({ "actorId": admin }),
    );
    assert_eq!(exams["exams"].as_array().map(|a| a.len()), Some(1));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn parent_cannot_import() {
    let workspace = temp_dir("gradebook-import-parent");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (_admin, _school, semester) = setup_school(&mut stdin, &mut reader, &workspace);

    let parent = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "auth.register",
        json!({ "username": "mum", "password": "pw", "role": "PARENT" }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "import.scores",
        json!({
            "actorId": str_at(&parent, "/user/id"),
            "examName": "Midterm",
            "semesterId": semester,
            "rows": [zhang_san_row()]
        }),
    );
    assert_eq!(code, "forbidden");

    let _ = std::fs::remove_dir_all(workspace);
}
