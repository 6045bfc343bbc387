//! Debugger scenarios: breakpoints, stop, stepping, aborting.

mod common;

use common::{clear_output, machine, output};

const PROGRAM_Q: &str = "\
program Q;
function main();
var i=0;
while i<3;
i=i+1;
end;
end;
";

#[test]
fn test_breakpoint_fires_on_each_loop_test() {
    let (mut m, console) = machine();
    m.load_program(PROGRAM_Q).expect("program parses");

    // line 4 is the while-condition line
    m.process_line("setBP 4;");
    assert_eq!(output(&console), "", "setBP reports nothing on success");

    m.process_line("debug;");
    let header = output(&console);
    assert!(header.contains("-- STOP "), "debug stops before the body runs");
    assert_eq!(m.stopped_count(), 1);

    clear_output(&console);
    let mut breaks = 0;
    for _ in 0..16 {
        m.process_line("go;");
        if m.stopped_count() == 0 {
            break;
        }
        breaks += 1;
    }
    let log = output(&console);
    assert!(breaks >= 3, "halts on the while line each iteration");
    assert!(log.contains("-- BREAK "));
    assert!(log.contains("line 4: [main] while i<3"));
    assert_eq!(m.stopped_count(), 0);
}

#[test]
fn test_breakpoint_on_declaration_rejected() {
    let (mut m, console) = machine();
    m.load_program(PROGRAM_Q).unwrap();
    // line 3 is `var i=0`, which the executor skips
    m.process_line("setBP 3;");
    assert!(output(&console).contains("statement is non-executable"));
}

#[test]
fn test_breakpoint_on_unsequenced_line_rejected() {
    let (mut m, console) = machine();
    m.load_program(PROGRAM_Q).unwrap();
    m.process_line("setBP 40;");
    assert!(output(&console).contains("no breakpoint at this line"));
}

#[test]
fn test_stop_statement_suspends_and_resumes() {
    let (mut m, console) = machine();
    let program = "\
program S;
function main();
var t=0;
t=1;
stop;
t=2;
return t;
end;
";
    m.load_program(program).unwrap();
    m.process_line("cout(main());");
    assert!(output(&console).contains("-- STOP "));
    assert_eq!(m.stopped_count(), 1);

    clear_output(&console);
    // inspect the stopped function's local through the # escape
    m.process_line("cout(#t);");
    assert_eq!(output(&console), "1");

    clear_output(&console);
    m.process_line("go;");
    // main resumed, returned 2, the suspended cout completed
    assert_eq!(output(&console), "2");
    assert_eq!(m.stopped_count(), 0);
}

#[test]
fn test_step_advances_one_statement() {
    let (mut m, console) = machine();
    let program = "\
program S;
function main();
var t=0;
t=1;
stop;
t=2;
t=3;
return t;
end;
";
    m.load_program(program).unwrap();
    m.process_line("main();");
    assert_eq!(m.stopped_count(), 1);

    clear_output(&console);
    m.process_line("step;");
    // stepping executed `t=2` and stopped again
    assert_eq!(m.stopped_count(), 1);
    m.process_line("cout(#t);");
    assert!(output(&console).contains('2'));

    m.process_line("go;");
    assert_eq!(m.stopped_count(), 0);
}

#[test]
fn test_abort_discards_stopped_program() {
    let (mut m, console) = machine();
    let program = "\
program S;
function main();
var t=0;
stop;
return t;
end;
";
    m.load_program(program).unwrap();
    m.process_line("main();");
    assert_eq!(m.stopped_count(), 1);

    clear_output(&console);
    m.process_line("abort;");
    assert!(output(&console).contains("aborted"));
    assert_eq!(m.stopped_count(), 0);
    assert_eq!(m.audit().live(rill::StringClass::LocalBase), 0);
}

#[test]
fn test_breakpoint_hit_count() {
    let (mut m, console) = machine();
    m.load_program(PROGRAM_Q).unwrap();
    // fire on the second hit only
    m.process_line("setBP 5, \"i\", 2;");
    m.process_line("debug;");
    clear_output(&console);

    m.process_line("go;");
    let log = output(&console);
    // first arrival at line 5 passes silently; the second fires
    assert!(log.contains("-- BREAK "));
    assert!(log.contains("line 5: [main]"));
    // the view expression printed the loop counter
    assert!(log.contains('1'));

    m.process_line("go;");
    assert_eq!(m.stopped_count(), 0);
}

#[test]
fn test_breakpoint_trigger_expression() {
    let (mut m, console) = machine();
    m.load_program(PROGRAM_Q).unwrap();
    m.process_line("setBP 5, \"i\", \"i==2\";");
    m.process_line("debug;");
    clear_output(&console);

    m.process_line("go;");
    let log = output(&console);
    assert!(log.contains("-- BREAK "), "fires only when i==2");
    m.process_line("go;");
    assert_eq!(m.stopped_count(), 0);
}

#[test]
fn test_disabled_breakpoint_does_not_fire() {
    let (mut m, console) = machine();
    m.load_program(PROGRAM_Q).unwrap();
    m.process_line("setBP 4;");
    m.process_line("disableBP 4;");
    m.process_line("debug;");
    clear_output(&console);
    m.process_line("go;");
    assert!(!output(&console).contains("-- BREAK "));
    assert_eq!(m.stopped_count(), 0);

    clear_output(&console);
    m.process_line("enableBP 4;");
    m.process_line("debug;");
    clear_output(&console);
    m.process_line("go;");
    assert!(output(&console).contains("-- BREAK "));
    m.process_line("abort;");
}

#[test]
fn test_bp_off_suppresses_all() {
    let (mut m, console) = machine();
    m.load_program(PROGRAM_Q).unwrap();
    m.process_line("setBP 4;");
    m.process_line("BPoff;");
    m.process_line("debug;");
    clear_output(&console);
    m.process_line("go;");
    assert!(!output(&console).contains("-- BREAK "));
    m.process_line("BPon;");
}

#[test]
fn test_clear_prog_leaves_table_draft() {
    let (mut m, console) = machine();
    m.load_program(PROGRAM_Q).unwrap();
    m.process_line("setBP 4;");
    m.process_line("clearProg;");
    m.process_line("listBP;");
    assert!(output(&console).contains("draft"));

    // reloading the program re-arms the surviving row
    clear_output(&console);
    m.load_program(PROGRAM_Q).unwrap();
    m.process_line("listBP;");
    let log = output(&console);
    assert!(!log.contains("draft"));
    assert!(log.contains("line    4"));
}

#[test]
fn test_list_breakpoints_output() {
    let (mut m, console) = machine();
    m.load_program(PROGRAM_Q).unwrap();
    m.process_line("setBP 4;");
    m.process_line("setBP 5, \"i\";");
    clear_output(&console);
    m.process_line("listBP;");
    let log = output(&console);
    // rows come out sorted by line
    let pos4 = log.find("line    4").expect("row for line 4");
    let pos5 = log.find("line    5").expect("row for line 5");
    assert!(pos4 < pos5);
    assert!(log.contains("view: i"));
}

#[test]
fn test_move_breakpoint() {
    let (mut m, console) = machine();
    m.load_program(PROGRAM_Q).unwrap();
    m.process_line("setBP 4;");
    m.process_line("moveBP 4, 5;");
    clear_output(&console);
    m.process_line("listBP;");
    let log = output(&console);
    assert!(log.contains("line    5"));
    assert!(!log.contains("line    4"));
}

#[test]
fn test_nested_stops_show_debug_level() {
    let (mut m, console) = machine();
    let program = "\
program N;
function main();
var t=0;
stop;
return t;
end;
";
    m.load_program(program).unwrap();
    m.process_line("main();");
    assert_eq!(m.stopped_count(), 1);
    clear_output(&console);
    m.process_line("main();");
    assert_eq!(m.stopped_count(), 2);
    assert!(output(&console).contains("-- [2] "));
    m.process_line("abort;");
    m.process_line("abort;");
    assert_eq!(m.stopped_count(), 0);
}
