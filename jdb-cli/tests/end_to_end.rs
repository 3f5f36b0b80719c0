//! End-to-end scenarios (§8): each writes a small program to a temp
//! file, runs the built `interpreter` binary against it, and asserts on
//! stdout.

use std::io::Write;
use std::process::Command;

fn run(source: &str) -> (String, String, bool) {
    let mut file = tempfile::Builder::new().suffix(".jdb").tempfile().expect("create temp source file");
    file.write_all(source.as_bytes()).expect("write source");
    let output = Command::new(env!("CARGO_BIN_EXE_interpreter"))
        .arg(file.path())
        .output()
        .expect("run interpreter");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn fibonacci_arithmetic_and_loops() {
    let src = r#"
FUNC FIB(N)
IF N<2 THEN
RETURN N
ENDIF
RETURN FIB(N-1)+FIB(N-2)
ENDFUNC
PRINT FIB(10)
"#;
    let (stdout, stderr, ok) = run(src);
    assert!(ok, "stderr: {stderr}");
    assert_eq!(stdout.trim(), "55");
}

#[test]
fn array_broadcast() {
    let src = r#"
LET A = [[1,2],[3,4]]
PRINT A + 10
"#;
    let (stdout, stderr, ok) = run(src);
    assert!(ok, "stderr: {stderr}");
    assert!(stdout.contains("[11 12]"), "stdout: {stdout}");
    assert!(stdout.contains("[13 14]"), "stdout: {stdout}");
}

#[test]
fn map_and_dot_access() {
    let src = r#"
LET P = {"name":"Ada","age":36}
PRINT P.name + " " + STR$(P.age)
"#;
    let (stdout, stderr, ok) = run(src);
    assert!(ok, "stderr: {stderr}");
    assert_eq!(stdout.trim(), "Ada 36");
}

#[test]
fn exception_flow_catches_division_by_zero() {
    let src = r#"
TRY
LET X = 1/0
CATCH
PRINT "caught", ERR
ENDTRY
"#;
    let (stdout, stderr, ok) = run(src);
    assert!(ok, "stderr: {stderr}");
    assert_eq!(stdout.trim(), "caught 2");
}

#[test]
fn autodiff_gradient() {
    let src = r#"
LET X = TENSOR.FROM([[2.0]])
LET Y = X * X + X * 3
TENSOR.BACKWARD(Y)
PRINT X.grad
"#;
    let (stdout, stderr, ok) = run(src);
    assert!(ok, "stderr: {stderr}");
    assert_eq!(stdout.trim(), "[[7]]");
}

#[test]
fn udt_instantiation_defaults_and_member_assignment() {
    let src = r#"
TYPE Point
X AS DOUBLE
Y AS DOUBLE
NAME AS STRING
ENDTYPE
LET P = Point.New()
PRINT P.X, P.Y, P.NAME
LET P.X = 3
LET P.Y = 4
PRINT P.X + P.Y
"#;
    let (stdout, stderr, ok) = run(src);
    assert!(ok, "stderr: {stderr}");
    let mut lines = stdout.lines();
    assert_eq!(lines.next().unwrap().trim(), "0 0");
    assert_eq!(lines.next().unwrap().trim(), "7");
}

#[test]
fn async_tasks_interleave_and_both_complete() {
    let src = r#"
FUNC WORKER(ID)
FOR I=1 TO 3
AWAIT SLEEP(0)
PRINT ID, I
NEXT
RETURN 0
ENDFUNC
LET T1 = STARTTASK WORKER(1)
LET T2 = STARTTASK WORKER(2)
AWAIT T1
AWAIT T2
PRINT "done"
"#;
    let (stdout, stderr, ok) = run(src);
    assert!(ok, "stderr: {stderr}");
    for (id, i) in [(1, 1), (1, 2), (1, 3), (2, 1), (2, 2), (2, 3)] {
        let needle = format!("{id} {i}");
        assert!(stdout.contains(&needle), "missing {needle:?} in stdout: {stdout}");
    }
    assert!(stdout.trim_end().ends_with("done"));
}
