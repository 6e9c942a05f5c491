use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_coursedashd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .env_remove("COURSEDASHD_DATA")
        .spawn()
        .expect("spawn coursedashd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn write_dataset(dir: &Path, student_info: &str) {
    std::fs::write(dir.join("studentInfo.csv"), student_info).expect("write studentInfo");
    std::fs::write(
        dir.join("assessments.csv"),
        "code_module,code_presentation,id_assessment,assessment_type,date,weight\n",
    )
    .expect("write assessments");
    std::fs::write(
        dir.join("studentAssessment.csv"),
        "id_assessment,id_student,date_submitted,is_banked,score\n",
    )
    .expect("write studentAssessment");
}

const HEADER: &str = "code_module,code_presentation,id_student,gender,region,highest_education,imd_band,age_band,num_of_prev_attempts,studied_credits,disability,final_result\n";

fn student_row(module: &str, pres: &str, id: i64, gender: &str, region: &str, result: &str) -> String {
    format!(
        "{},{},{},{},{},HE Qualification,50-60%,35-55,0,60,N,{}\n",
        module, pres, id, gender, region, result
    )
}

fn labels(result: &serde_json::Value) -> Vec<(String, i64)> {
    result["rows"]
        .as_array()
        .expect("rows")
        .iter()
        .map(|r| {
            (
                r["presentationKey"].as_str().expect("key").to_string(),
                r["studentCount"].as_i64().expect("count"),
            )
        })
        .collect()
}

#[test]
fn popularity_requires_a_dataset() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let resp = request(&mut stdin, &mut reader, "1", "popularity.open", json!({}));
    assert_eq!(resp["ok"], json!(false));
    assert_eq!(error_code(&resp), "no_dataset");
    drop(stdin);
    let _ = child.wait();
}

#[test]
fn single_passing_student_is_the_whole_ranking() {
    let dir = temp_dir("coursedash-pop-single");
    write_dataset(&dir, &format!("{}{}", HEADER, student_row("AAA", "2013J", 1, "M", "Wales", "Pass")));

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(&mut stdin, &mut reader, "1", "dataset.open", json!({ "path": dir.to_string_lossy() }));
    let res = request_ok(&mut stdin, &mut reader, "2", "popularity.open", json!({}));
    assert_eq!(labels(&res), vec![("AAA_2013J".to_string(), 1)]);

    let chart = &res["chart"];
    assert_eq!(chart["kind"], json!("bar"));
    assert_eq!(chart["orientation"], json!("h"));
    assert_eq!(chart["reverseCategoryAxis"], json!(true));
    assert_eq!(chart["series"][0]["text"], json!("1"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn ranking_is_top_five_by_distinct_students_with_filters() {
    let dir = temp_dir("coursedash-pop-filters");
    let mut csv = HEADER.to_string();
    let mut id = 100;
    // (module, presentation, passing students)
    for (module, pres, n) in [
        ("AAA", "2013J", 6),
        ("BBB", "2013J", 5),
        ("CCC", "2014B", 4),
        ("DDD", "2014J", 3),
        ("EEE", "2013B", 2),
        ("FFF", "2014J", 1),
    ] {
        for _ in 0..n {
            id += 1;
            csv.push_str(&student_row(module, pres, id, "M", "Wales", "Pass"));
        }
    }
    // Repeat enrolment of one student must not double count.
    csv.push_str(&student_row("FFF", "2014J", 101, "M", "Wales", "Distinction"));
    // Failed and withdrawn students never count.
    for k in 0..10 {
        csv.push_str(&student_row("ZZZ", "2014J", 900 + k, "F", "Scotland", "Fail"));
        csv.push_str(&student_row("ZZZ", "2014J", 950 + k, "F", "Scotland", "Withdrawn"));
    }
    csv.push_str(&student_row("FFF", "2014J", 500, "F", "Scotland", "Pass"));
    write_dataset(&dir, &csv);

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(&mut stdin, &mut reader, "1", "dataset.open", json!({ "path": dir.to_string_lossy() }));

    let all = request_ok(&mut stdin, &mut reader, "2", "popularity.open", json!({ "filters": { "year": "both" } }));
    assert_eq!(
        labels(&all),
        vec![
            ("AAA_2013J".to_string(), 6),
            ("BBB_2013J".to_string(), 5),
            ("CCC_2014B".to_string(), 4),
            ("DDD_2014J".to_string(), 3),
            ("FFF_2014J".to_string(), 3),
        ]
    );
    assert_eq!(all["distinctKeys"], json!(6));

    let y2014 = request_ok(&mut stdin, &mut reader, "3", "popularity.open", json!({ "filters": { "year": "2014" } }));
    assert_eq!(
        labels(&y2014),
        vec![
            ("CCC_2014B".to_string(), 4),
            ("DDD_2014J".to_string(), 3),
            ("FFF_2014J".to_string(), 3),
        ]
    );

    let scots = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "pipeline.run",
        json!({ "mode": "popularity", "filters": { "regions": ["Scotland"], "genders": ["F"] } }),
    );
    assert_eq!(scots["mode"], json!("popularity"));
    assert_eq!(labels(&scots), vec![("FFF_2014J".to_string(), 1)]);

    let nobody = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "popularity.open",
        json!({ "filters": { "regions": ["Atlantis"] } }),
    );
    assert!(labels(&nobody).is_empty());

    let opts = request_ok(&mut stdin, &mut reader, "6", "popularity.options", json!({}));
    assert_eq!(opts["regions"], json!(["Wales", "Scotland"]));
    assert_eq!(opts["years"], json!(["2013", "2014", "both"]));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn malformed_presentation_code_is_reported() {
    let dir = temp_dir("coursedash-pop-malformed");
    let csv = format!(
        "{}{}{}",
        HEADER,
        student_row("AAA", "2013J", 1, "M", "Wales", "Pass"),
        student_row("AAA", "J", 2, "M", "Wales", "Withdrawn"),
    );
    write_dataset(&dir, &csv);

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(&mut stdin, &mut reader, "1", "dataset.open", json!({ "path": dir.to_string_lossy() }));
    let resp = request(&mut stdin, &mut reader, "2", "popularity.open", json!({}));
    assert_eq!(resp["ok"], json!(false));
    assert_eq!(error_code(&resp), "malformed_presentation_code");

    let bad_year = request(
        &mut stdin,
        &mut reader,
        "3",
        "popularity.open",
        json!({ "filters": { "year": "2015" } }),
    );
    assert_eq!(error_code(&bad_year), "bad_params");

    drop(stdin);
    let _ = child.wait();
}
