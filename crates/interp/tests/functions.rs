//! User function semantics: parameters, defaults, by-reference passing,
//! scopes, forward references.

mod common;

use common::{clear_output, machine, output};

#[test]
fn test_by_reference_and_default_parameters() {
    let (mut m, console) = machine();
    let program = "\
program T;
function bump(x, d=1);
x = x + d;
return x;
end;
";
    m.load_program(program).expect("program parses");

    m.process_line("var q=5; bump(q); cout(q);");
    assert_eq!(output(&console), "6");

    clear_output(&console);
    m.process_line("cout(bump(q,10), q);");
    assert_eq!(output(&console), "1616");
}

#[test]
fn test_expression_argument_passes_by_value() {
    let (mut m, console) = machine();
    let program = "\
program T;
function bump(x, d=1);
x = x + d;
return x;
end;
";
    m.load_program(program).expect("program parses");
    m.process_line("var q=5; cout(bump(q+0), q);");
    // q+0 is not a bare variable, so q keeps its value
    assert_eq!(output(&console), "65");
}

#[test]
fn test_forward_reference_arg_count_checked() {
    let (mut m, _console) = machine();
    // mutual recursion: even() calls odd() before it is defined
    let program = "\
program M;
function even(n);
if n==0;
return 1;
end;
return odd(n-1);
end;
function odd(n);
if n==0;
return 0;
end;
return even(n-1);
end;
";
    m.load_program(program).expect("forward reference parses");
    let (mut m2, console2) = machine();
    m2.load_program(program).unwrap();
    m2.process_line("cout(even(10), odd(10));");
    assert_eq!(output(&console2), "10");
    let _ = m;
}

#[test]
fn test_forward_call_count_conflict_rejected() {
    let (mut m, _console) = machine();
    let program = "\
program M;
function caller();
return helper(1, 2, 3);
end;
function helper(a);
return a;
end;
";
    let err = m.load_program(program).unwrap_err();
    assert!(err.to_string().contains("previous call"));
}

#[test]
fn test_statics_persist_across_calls() {
    let (mut m, console) = machine();
    let program = "\
program S;
function counter();
static n=0;
n=n+1;
return n;
end;
";
    m.load_program(program).unwrap();
    m.process_line("counter(); counter(); cout(counter());");
    assert_eq!(output(&console), "3");
}

#[test]
fn test_locals_shadow_globals() {
    let (mut m, console) = machine();
    let program = "\
program S;
var g=100;
function probe();
var g=1;
g=g+1;
return g;
end;
";
    m.load_program(program).unwrap();
    m.process_line("cout(probe(), g);");
    assert_eq!(output(&console), "2100");
}

#[test]
fn test_array_parameter_aliases_caller_array() {
    let (mut m, console) = machine();
    let program = "\
program A;
function fill(arr(), v);
arr(1) = v;
return 0;
end;
";
    m.load_program(program).unwrap();
    m.process_line("var data(3); fill(data, 42); cout(data(1));");
    assert_eq!(output(&console), "42");
}

#[test]
fn test_scalar_array_mismatch_rejected() {
    let (mut m, console) = machine();
    let program = "\
program A;
function fill(arr(), v);
arr(1) = v;
return 0;
end;
";
    m.load_program(program).unwrap();
    m.process_line("var x=1; fill(x, 2);");
    assert!(output(&console).contains("scalar and array arguments"));
}

#[test]
fn test_sixteenth_mandatory_parameter_rejected() {
    let (mut m, _console) = machine();
    let ok = "\
program P;
function wide(p1,p2,p3,p4,p5,p6,p7,p8,p9,p10,p11,p12,p13,p14,p15);
return p15;
end;
";
    m.load_program(ok).expect("15 parameters accepted");

    let (mut m2, _c2) = machine();
    let too_many = "\
program P;
function wide(p1,p2,p3,p4,p5,p6,p7,p8,p9,p10,p11,p12,p13,p14,p15,p16);
return p16;
end;
";
    let err = m2.load_program(too_many).unwrap_err();
    assert!(err.to_string().contains("too many function arguments"));
}

#[test]
fn test_return_frees_local_strings() {
    let (mut m, console) = machine();
    let program = "\
program L;
function make();
var s = \"local\";
s = s + \"!\";
return s;
end;
";
    m.load_program(program).unwrap();
    m.process_line("cout(make());");
    assert_eq!(output(&console), "local!");
    assert_eq!(m.audit().live(rill::StringClass::LocalVarStr), 0);
    assert_eq!(m.audit().live(rill::StringClass::LocalBase), 0);
}

#[test]
fn test_undefined_function_fails_program_parse() {
    let (mut m, _console) = machine();
    let program = "\
program U;
function top();
return ghost(1);
end;
";
    let err = m.load_program(program).unwrap_err();
    assert!(err.to_string().contains("never defined"));
}
