
use serde_json::json;
use test_support::{request_err, request_ok, setup_school, spawn_sidecar, str_at, temp_dir};

#[test]
fn parent_binds_child_through_invite_code_and_sees_grades() {
    let workspace = temp_dir("gradebook-parents");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin, school_id, semester) = setup_school(&mut stdin, &mut reader, &workspace);

    for (i, (name, date, math)) in [("Midterm", "2024-11-05", 80), ("Final", "2025-01-10", 90)]
        .into_iter()
        .enumerate()
    {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("imp-{}", i),
            "import.scores",
            json!({
                "actorId": admin,
                "examName": name,
                "semesterId": semester,
                "examDate": date,
                "rows": [{ "studentNo": "2024001", "name": "Zhang San", "grade": "Grade 9", "class": "Class 1", "math": math }]
            }),
        );
    }
    let classes = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "classes.list",
        json!({ "actorId": admin }),
    );
    let class_id = str_at(&classes, "/classes/0/id").to_string();
    let grade_id = str_at(&classes, "/classes/0/gradeId").to_string();

    let invitation = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "invitations.create",
        json!({ "actorId": admin, "gradeId": grade_id }),
    );
    let code = str_at(&invitation, "/invitation/code").to_string();
    assert_eq!(code.len(), 6);

    // Resolution is public and case-insensitive.
    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "invitations.resolve",
        json!({ "code": code.to_lowercase() }),
    );
    assert_eq!(resolved["schoolId"], json!(school_id));
    assert_eq!(resolved["gradeName"], json!("Grade 9"));
    assert_eq!(resolved["classes"][0]["id"], json!(class_id));
    let bad = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "invitations.resolve",
        json!({ "code": "1O1O1O" }),
    );
    assert_eq!(bad, "invalid_invite_code");

    let parent = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "auth.register",
        json!({ "username": "zhang.parent", "password": "pw", "role": "PARENT" }),
    );
    let parent_id = str_at(&parent, "/user/id").to_string();

    let missing = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "parents.findStudent",
        json!({ "actorId": parent_id, "inviteCode": code, "classId": class_id, "name": "zhang san" }),
    );
    assert_eq!(missing, "not_found");
    let found = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "parents.findStudent",
        json!({ "actorId": parent_id, "inviteCode": code, "classId": class_id, "name": "Zhang San" }),
    );
    let student_id = str_at(&found, "/student/id").to_string();
    assert_eq!(found["className"], json!("Class 1"));

    let grades_before = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "parents.childGrades",
        json!({ "actorId": parent_id, "studentId": student_id }),
    );
    assert_eq!(grades_before, "forbidden");

    let bound = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "parents.bind",
        json!({ "actorId": parent_id, "studentId": student_id }),
    );
    assert_eq!(bound["alreadyBound"], json!(false));
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "parents.bind",
        json!({ "actorId": parent_id, "studentId": student_id }),
    );
    assert_eq!(again["alreadyBound"], json!(true));
    assert_eq!(again["user"]["childIds"], json!([student_id]));

    let rebind = request_err(
        &mut stdin,
        &mut reader,
        "11",
        "parents.findStudent",
        json!({ "actorId": parent_id, "inviteCode": code, "classId": class_id, "name": "Zhang San" }),
    );
    assert_eq!(rebind, "conflict");

    let children = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "parents.children",
        json!({ "actorId": parent_id }),
    );
    assert_eq!(children["children"][0]["student"]["id"], json!(student_id));
    assert_eq!(children["children"][0]["schoolName"], json!("No. 1 Middle School"));

    let grades = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "parents.childGrades",
        json!({ "actorId": parent_id, "studentId": student_id }),
    );
    assert_eq!(grades["records"].as_array().map(|a| a.len()), Some(2));
    let trend = grades["trend"].as_array().expect("trend");
    assert_eq!(trend.len(), 2);
    assert_eq!(trend[0]["examName"], json!("Midterm"));
    assert_eq!(trend[1]["examName"], json!("Final"));

    let linked = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "students.parents.list",
        json!({ "actorId": admin, "studentId": student_id }),
    );
    assert_eq!(linked["parents"][0]["id"], json!(parent_id));

    // Staff-only methods refuse parents.
    let denied = request_err(
        &mut stdin,
        &mut reader,
        "15",
        "students.list",
        json!({ "actorId": parent_id }),
    );
    assert_eq!(denied, "forbidden");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn admin_links_and_unlinks_parents_and_student_delete_drops_links() {
    let workspace = temp_dir("gradebook-parent-links");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin, _school, _semester) = setup_school(&mut stdin, &mut reader, &workspace);

    let grade = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "gradeLevels.create",
        json!({ "actorId": admin, "name": "Grade 1" }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "actorId": admin, "gradeId": str_at(&grade, "/gradeLevel/id"), "name": "Class 1" }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "actorId": admin, "classId": str_at(&class, "/class/id"), "name": "Kid", "studentNo": "1" }),
    );
    let student_id = str_at(&student, "/student/id").to_string();
    let parent = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "auth.register",
        json!({ "username": "dad", "password": "pw", "role": "PARENT" }),
    );
    let parent_id = str_at(&parent, "/user/id").to_string();

    let linked = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.parents.link",
        json!({ "actorId": admin, "studentId": student_id, "parent": "dad" }),
    );
    assert_eq!(linked["alreadyLinked"], json!(false));
    let not_parent = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "students.parents.link",
        json!({ "actorId": admin, "studentId": student_id, "parent": "admin" }),
    );
    assert_eq!(not_parent, "bad_params");

    let unlinked = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.parents.unlink",
        json!({ "actorId": admin, "studentId": student_id, "parentId": parent_id }),
    );
    assert_eq!(unlinked["unlinked"], json!(true));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "parents.bind",
        json!({ "actorId": parent_id, "studentId": student_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.delete",
        json!({ "actorId": admin, "studentId": student_id }),
    );
    let children = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "parents.children",
        json!({ "actorId": parent_id }),
    );
    assert_eq!(children["children"], json!([]));

    let _ = std::fs::remove_dir_all(workspace);
}
