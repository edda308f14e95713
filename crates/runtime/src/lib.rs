//! `element-runtime`: the virtual machine, native function catalog, module
//! loader, and error reporting that together execute a compiled `element`
//! program (§4-§7).

pub mod arithmetic;
pub mod error;
pub mod module_loader;
pub mod natives;
pub mod vm;

pub use error::is_error;
pub use vm::Vm;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn vm() -> Vm {
        Vm::new(PathBuf::from("."))
    }

    #[test]
    fn arithmetic_roundtrips_through_eval() {
        let mut vm = vm();
        let result = vm.eval_source("return 1 + 2 * 3;", "<test>");
        assert!(matches!(result, element_core::Value::Int(7)));
    }

    #[test]
    fn string_concatenation_uses_tilde_not_plus() {
        let mut vm = vm();
        let result = vm.eval_source("return \"a\" ~ \"b\";", "<test>");
        match result {
            element_core::Value::String(s) => assert_eq!(&*s.as_ref().as_str(), "ab"),
            other => panic!("expected a string, got {other:?}"),
        }
    }

    #[test]
    fn function_calls_and_returns_a_value() {
        let mut vm = vm();
        let result = vm.eval_source("f = :(x) { return x + 1; }; return f(41);", "<test>");
        assert!(matches!(result, element_core::Value::Int(42)));
    }

    #[test]
    fn prototype_chain_lookup_finds_inherited_member() {
        let mut vm = vm();
        let result = vm.eval_source(
            "base = [= value = 10]; child = [= proto = base]; return child.value;",
            "<test>",
        );
        assert!(matches!(result, element_core::Value::Int(10)));
    }

    #[test]
    fn division_by_zero_raises_a_runtime_error() {
        let mut vm = vm();
        let result = vm.eval_source("return 1 / 0;", "<test>");
        assert!(is_error(&result));
    }

    #[test]
    fn float_division_by_zero_follows_ieee_not_an_error() {
        let mut vm = vm();
        let result = vm.eval_source("return 1.0 / 0.0;", "<test>");
        match result {
            element_core::Value::Float(f) => assert!(f.is_infinite() && f > 0.0),
            other => panic!("expected +inf float, got {other:?}"),
        }
    }

    #[test]
    fn plus_on_two_strings_is_rejected() {
        let mut vm = vm();
        let result = vm.eval_source("return \"a\" + \"b\";", "<test>");
        assert!(is_error(&result));
    }

    // S1 - Fibonacci by recursion.
    #[test]
    fn fibonacci_by_recursion() {
        let mut vm = vm();
        let result = vm.eval_source(
            "fib = :(n) { if (n < 2) { n } else { fib(n-1) + fib(n-2) } }; return fib(10);",
            "<test>",
        );
        assert!(matches!(result, element_core::Value::Int(55)));
    }

    // S2 - closure captures a loop variable by box, not by the shared slot.
    #[test]
    fn closure_captures_loop_variable_by_box() {
        let mut vm = vm();
        let result = vm.eval_source(
            "makers = []; for (i in range(3)) { makers << :: i }; \
             return [makers[0](), makers[1](), makers[2]()];",
            "<test>",
        );
        match result {
            element_core::Value::Array(a) => {
                let elems = a.as_ref().elements.borrow();
                assert_eq!(elems.len(), 3);
                assert!(matches!(elems[0], element_core::Value::Int(0)));
                assert!(matches!(elems[1], element_core::Value::Int(1)));
                assert!(matches!(elems[2], element_core::Value::Int(2)));
            }
            other => panic!("expected an array, got {other:?}"),
        }
    }

    // S3 - coroutine producing a finite sequence via the for/iterator protocol.
    #[test]
    fn coroutine_produces_a_finite_sequence() {
        let mut vm = vm();
        let result = vm.eval_source(
            "gen = :() { yield 1; yield 2; yield 3 }; out = []; \
             for (x in make_coroutine(gen)) { out << x } return out;",
            "<test>",
        );
        match result {
            element_core::Value::Array(a) => {
                let elems = a.as_ref().elements.borrow();
                assert_eq!(elems.len(), 3);
                assert!(matches!(elems[0], element_core::Value::Int(1)));
                assert!(matches!(elems[1], element_core::Value::Int(2)));
                assert!(matches!(elems[2], element_core::Value::Int(3)));
            }
            other => panic!("expected an array, got {other:?}"),
        }
    }

    // S4 was already covered by `prototype_chain_lookup_finds_inherited_member`
    // above; this adds the exact spec scenario (a method, not a data member).
    #[test]
    fn prototype_based_member_resolution_finds_inherited_method() {
        let mut vm = vm();
        let result = vm.eval_source(
            "base = [= greet = :() \"hi\" ]; child = [= proto = base ]; return child.greet();",
            "<test>",
        );
        match result {
            element_core::Value::String(s) => assert_eq!(&*s.as_ref().as_str(), "hi"),
            other => panic!("expected a string, got {other:?}"),
        }
    }

    // S5 - `return` as the RHS of a short-circuit `or` bails out of the
    // function entirely, rather than just producing a boolean.
    #[test]
    fn short_circuit_with_control_flow() {
        let mut vm = vm();
        let result = vm.eval_source(
            "f = :(x) { x > 0 or return -1; return x * 2; }; return [f(3), f(-5)];",
            "<test>",
        );
        match result {
            element_core::Value::Array(a) => {
                let elems = a.as_ref().elements.borrow();
                assert!(matches!(elems[0], element_core::Value::Int(6)));
                assert!(matches!(elems[1], element_core::Value::Int(-1)));
            }
            other => panic!("expected an array, got {other:?}"),
        }
    }

    #[test]
    fn negative_array_index_counts_from_the_end() {
        let mut vm = vm();
        let result = vm.eval_source("a = [10, 20, 30]; return a[-1];", "<test>");
        assert!(matches!(result, element_core::Value::Int(30)));
    }

    #[test]
    fn out_of_range_array_index_is_an_error() {
        let mut vm = vm();
        let result = vm.eval_source("a = [10, 20, 30]; return a[5];", "<test>");
        assert!(is_error(&result));
    }

    #[test]
    fn empty_while_loop_producing_a_value_yields_nil() {
        let mut vm = vm();
        let result = vm.eval_source("return while (false) { 1 };", "<test>");
        assert!(matches!(result, element_core::Value::Nil));
    }

    #[test]
    fn coroutine_that_never_yields_produces_nothing() {
        // Boundary behavior (§8): make_iterator(co) on a coroutine that
        // never yields is initially has_next == true, but a single advance
        // finishes it, so the `for` body never runs.
        let mut vm = vm();
        let result = vm.eval_source(
            "gen = :() { return 1; }; out = []; \
             for (x in make_coroutine(gen)) { out << x } return out;",
            "<test>",
        );
        match result {
            element_core::Value::Array(a) => assert!(a.as_ref().elements.borrow().is_empty()),
            other => panic!("expected an empty array, got {other:?}"),
        }
    }
}
