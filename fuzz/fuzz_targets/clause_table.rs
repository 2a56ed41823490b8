#![no_main]

use eeruntime::runtime::exceptions::EHClauseIterator;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(clauses) = EHClauseIterator::new(data) {
        for clause in clauses {
            match clause {
                Ok(clause) => assert!(clause.try_start_offset <= clause.try_end_offset),
                Err(_) => break,
            }
        }
    }
});
