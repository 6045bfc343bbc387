//! End-to-end scenarios: immediate statements, recursion, strings,
//! `eval` / `quote` round trips.

mod common;

use common::{clear_output, machine, output};
use rill::{StringClass, Value};

#[test]
fn test_assign_and_print() {
    let (mut m, console) = machine();
    m.process_line("var a=3; a=a+4; cout(a);");
    assert_eq!(output(&console), "7");
    // the a=a+4 statement's result lands in the last-results FIFO
    assert_eq!(m.last_result(1), Some(Value::Long(7)));
}

#[test]
fn test_recursive_factorial() {
    let (mut m, console) = machine();
    let program = "\
program P;
function fact(n);
if n<=1;
return 1;
end;
return n*fact(n-1);
end;
";
    m.load_program(program).expect("program parses");
    m.process_line("cout(fact(5));");
    assert_eq!(output(&console), "120");
    assert_eq!(m.stopped_count(), 0);
    assert_eq!(m.audit().live(StringClass::Intermediate), 0);
}

#[test]
fn test_string_concat_and_len() {
    let (mut m, console) = machine();
    m.process_line(r#"var s="he"+"llo"; cout(len(s),s);"#);
    // no separator between cout arguments
    assert_eq!(output(&console), "5hello");
    assert_eq!(m.audit().live(StringClass::UserVarStr), 1);
}

#[test]
fn test_bit_set_writes_back() {
    let (mut m, console) = machine();
    m.process_line("var b=0x1234; bitSet(b,4); cout(b);");
    assert_eq!(output(&console), "4676");
}

#[test]
fn test_eval_and_quote() {
    let (mut m, console) = machine();
    m.process_line(r#"cout(eval("2+3*4"));"#);
    assert_eq!(output(&console), "14");

    clear_output(&console);
    m.process_line("cout(quote(14));");
    assert_eq!(output(&console), "14");

    clear_output(&console);
    m.process_line("cout(eval(quote(3.5)));");
    assert_eq!(output(&console), "3.5");
}

#[test]
fn test_eval_quote_string_roundtrip() {
    let (mut m, console) = machine();
    m.process_line(r#"var s="ab\"c"; cout(eval(quote(s)));"#);
    assert_eq!(output(&console), "ab\"c");
}

#[test]
fn test_operator_precedence_and_associativity() {
    let (mut m, console) = machine();
    m.process_line("cout(2+3*4, 2**3**2, (2+3)*4, -2**2);");
    // ** binds right-to-left and tighter than unary minus
    assert_eq!(output(&console), "1451220-4");
}

#[test]
fn test_compound_assignment_and_incr() {
    let (mut m, console) = machine();
    m.process_line("var x=10; x+=5; x++; cout(x);");
    assert_eq!(output(&console), "16");
    clear_output(&console);
    m.process_line("var y=3; cout(y++); cout(y); cout(++y);");
    assert_eq!(output(&console), "345");
}

#[test]
fn test_if_elseif_else_chain() {
    let (mut m, console) = machine();
    m.process_line(r#"var n=2; if n==1; cout("one"); elseif n==2; cout("two"); else; cout("many"); end;"#);
    assert_eq!(output(&console), "two");

    clear_output(&console);
    m.process_line(r#"n=9; if n==1; cout("one"); elseif n==2; cout("two"); else; cout("many"); end;"#);
    assert_eq!(output(&console), "many");
}

#[test]
fn test_for_loop_accumulates() {
    let (mut m, console) = machine();
    m.process_line("var k=0; var t=0;");
    m.process_line("for k=1,4; t=t+k; end; cout(t);");
    assert_eq!(output(&console), "10");
}

#[test]
fn test_for_loop_skips_exhausted_range() {
    let (mut m, console) = machine();
    m.process_line("var k=0; var t=0;");
    m.process_line("for k=5,1; t=t+1; end; cout(t);");
    assert_eq!(output(&console), "0");
}

#[test]
fn test_while_with_break_continue() {
    let (mut m, console) = machine();
    m.process_line("var i=0; var t=0;");
    m.process_line(
        "while 1; i=i+1; if i==3; continue; end; if i>5; break; end; t=t+i; end; cout(t);",
    );
    // 1+2+4+5 (3 skipped, loop leaves at 6)
    assert_eq!(output(&console), "12");
}

#[test]
fn test_long_min_hex_literal() {
    let (mut m, console) = machine();
    m.process_line("cout(0x80000000);");
    assert_eq!(output(&console), "-2147483648");
}

#[test]
fn test_array_declaration_bounds() {
    let (mut m, console) = machine();
    m.process_line("var ok(255);");
    assert_eq!(output(&console), "", "255 is the last accepted extent");
    m.process_line("var bad(256);");
    assert!(output(&console).contains("array dimension must be 1 to 255"));
}

#[test]
fn test_array_elements_and_ubound() {
    let (mut m, console) = machine();
    m.process_line("var a(3); a(1)=10; a(2)=a(1)*2; cout(a(2), ubound(a,1), dims(a));");
    assert_eq!(output(&console), "2031");
}

#[test]
fn test_array_element_type_is_fixed() {
    let (mut m, console) = machine();
    // numeric arrays silently coerce long<->float
    m.process_line("var a(2); a(1)=2.5; cout(a(1));");
    assert_eq!(output(&console), "2.5");

    clear_output(&console);
    m.process_line(r#"a(2)="text";"#);
    assert!(output(&console).contains("array value type is fixed"));

    clear_output(&console);
    m.process_line(r#"var sa(2)=""; sa(1)="x"; cout(sa(1));"#);
    assert_eq!(output(&console), "x");
    clear_output(&console);
    m.process_line("sa(2)=5;");
    assert!(output(&console).contains("array value type is fixed"));
}

#[test]
fn test_delete_then_redeclare() {
    let (mut m, console) = machine();
    m.process_line("var v=1;");
    m.process_line("delete v;");
    m.process_line("var v=2; cout(v);");
    assert_eq!(output(&console), "2");
}

#[test]
fn test_last_fifo_depth_order() {
    let (mut m, console) = machine();
    m.process_line("1+1;");
    m.process_line("2+2;");
    m.process_line("cout(last(1), last(2));");
    assert_eq!(output(&console), "42");
}

#[test]
fn test_trap_errors_and_err() {
    let (mut m, console) = machine();
    m.process_line("trapErrors 1; var x=1; x=1/0; cout(err());");
    // division by zero trapped, execution continued, code retrievable
    assert_eq!(output(&console), "3010");
    clear_output(&console);
    m.process_line("clearError; cout(err());");
    assert_eq!(output(&console), "0");
}

#[test]
fn test_untrapped_error_reports_and_aborts_statement() {
    let (mut m, console) = machine();
    m.process_line("var x=5; x=x/0; cout(x);");
    let out = output(&console);
    assert!(out.contains("division by zero"));
    // the rest of the line was not executed
    assert!(!out.contains('5'));
}

#[test]
fn test_symbolic_constants() {
    let (mut m, console) = machine();
    m.process_line("cout(TRUE, FALSE, CONSOLE, FILE3, DEGREES);");
    assert_eq!(output(&console), "10031");
}

#[test]
fn test_cannot_change_constant() {
    let (mut m, console) = machine();
    m.process_line("const C=7;");
    m.process_line("C=8;");
    assert!(output(&console).contains("cannot assign to a constant"));
}

#[test]
fn test_undeclared_variable_rejected() {
    let (mut m, console) = machine();
    m.process_line("nope=1;");
    assert!(output(&console).contains("variable not declared"));
}

#[test]
fn test_clear_mem_balances_heap_audit() {
    let (mut m, console) = machine();
    m.process_line(r#"var s="abc"; var t="def"+"ghi"; var a(4)="";"#);
    m.process_line(r#"a(1)="elem"; 1+1; "keep"+"me";"#);
    m.process_line("clearMem;");
    let _ = console;
    assert!(m.audit().all_balanced());
    assert_eq!(m.audit().total_errors(), 0);
}

#[test]
fn test_string_functions() {
    let (mut m, console) = machine();
    m.process_line(r#"cout(left("rilllang",4), mid("abcdef",3,2), right("abc",2));"#);
    assert_eq!(output(&console), "rillcdbc");

    clear_output(&console);
    m.process_line(r#"cout(strCmp("a","b"), strCmp("b","b"), strCmp("c","b"));"#);
    assert_eq!(output(&console), "-101");

    clear_output(&console);
    m.process_line(r#"cout(findStr("hello world","world"), toUpper("ab"));"#);
    assert_eq!(output(&console), "7AB");

    clear_output(&console);
    m.process_line(r#"cout(trim("  pad  "), len(trim("  pad  ")));"#);
    assert_eq!(output(&console), "pad3");
}

#[test]
fn test_lookup_functions() {
    let (mut m, console) = machine();
    m.process_line("cout(ifte(0, 10, 20), choose(2, 5, 6, 7), index(6, 5, 6, 7));");
    assert_eq!(output(&console), "2062");
}

#[test]
fn test_float_vs_long_division() {
    let (mut m, console) = machine();
    m.process_line("cout(7/2, 7.0/2);");
    assert_eq!(output(&console), "33.5");
}

#[test]
fn test_cout_list_variant() {
    let (mut m, console) = machine();
    m.process_line("coutList(1, 2, 3);");
    assert_eq!(output(&console), "1, 2, 3");
    clear_output(&console);
    m.process_line("coutLine(9);");
    assert_eq!(output(&console), "9\n");
}
