//! Integration tests for two-pass exception dispatch over multi-frame stacks.
//!
//! The stacks are recorded up front and replayed by a [`ShadowStackWalker`]; funclets are
//! simulated by a callback object that logs every invocation.

use eeruntime::prelude::*;

const IMAGE_BASE: u64 = 0x20_0000;
const CLAUSE_BASE: u64 = 0x30_0000;
const THROWN: ObjectRef = ObjectRef::new(0x5000_0000);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Funclet {
    Filter(u64),
    Finally(u64),
}

/// Callbacks that accept or fail filters by address and log every funclet.
struct ScriptedCallbacks {
    exception_type: u64,
    accepting_filters: Vec<u64>,
    failing_funclets: Vec<u64>,
    log: Vec<Funclet>,
}

impl ScriptedCallbacks {
    fn new(exception_type: u64) -> Self {
        ScriptedCallbacks {
            exception_type,
            accepting_filters: Vec::new(),
            failing_funclets: Vec::new(),
            log: Vec::new(),
        }
    }

    fn finallies(&self) -> Vec<u64> {
        self.log
            .iter()
            .filter_map(|call| match call {
                Funclet::Finally(handler) => Some(*handler),
                Funclet::Filter(_) => None,
            })
            .collect()
    }
}

impl ExceptionCallbacks for ScriptedCallbacks {
    fn exception_type(&self, exception: ObjectRef) -> Result<u64> {
        if exception.is_null() {
            return Err(Error::NotSupported("null exception".to_string()));
        }
        Ok(self.exception_type)
    }

    fn call_filter_funclet(
        &mut self,
        _exception: ObjectRef,
        filter: u64,
        _shadow_stack: u64,
    ) -> Result<bool> {
        self.log.push(Funclet::Filter(filter));
        if self.failing_funclets.contains(&filter) {
            return Err(Error::NotSupported(format!("filter 0x{filter:X} threw")));
        }
        Ok(self.accepting_filters.contains(&filter))
    }

    fn call_finally_funclet(&mut self, handler: u64, _shadow_stack: u64) -> Result<()> {
        self.log.push(Funclet::Finally(handler));
        if self.failing_funclets.contains(&handler) {
            return Err(Error::NotSupported(format!("finally 0x{handler:X} threw")));
        }
        Ok(())
    }
}

struct Universe {
    memory: AddressSpace,
    object: u64,
    exception: u64,
    argument_exception: u64,
    format_exception: u64,
}

fn universe() -> Result<Universe> {
    let mut memory = AddressSpace::new(TargetLayout::native64());
    let image = memory.map_region(IMAGE_BASE, 0x2000, RegionKind::Image)?;

    let object = TypeDescriptorBuilder::new()
        .base_size(24)
        .build(&mut memory, image)?;
    let exception = TypeDescriptorBuilder::new()
        .base_size(128)
        .base_type(object)
        .build(&mut memory, image)?;
    let argument_exception = TypeDescriptorBuilder::new()
        .base_size(136)
        .base_type(exception)
        .build(&mut memory, image)?;
    let format_exception = TypeDescriptorBuilder::new()
        .base_size(128)
        .base_type(exception)
        .build(&mut memory, image)?;

    Ok(Universe {
        memory,
        object,
        exception,
        argument_exception,
        format_exception,
    })
}

fn symbol(descriptor: u64) -> u32 {
    u32::try_from(descriptor).unwrap()
}

fn map_tables(memory: &mut AddressSpace, tables: &[ClauseTableBuilder]) -> Result<Vec<u64>> {
    let encoded: Vec<Vec<u8>> = tables.iter().map(ClauseTableBuilder::encode).collect();
    let size = encoded.iter().map(Vec::len).sum::<usize>();
    let region = memory.map_region(CLAUSE_BASE, size.max(1), RegionKind::Image)?;

    let mut addresses = Vec::with_capacity(encoded.len());
    for bytes in &encoded {
        let address = memory.allocate(region, bytes.len(), 1)?;
        memory.write_bytes(address, bytes)?;
        addresses.push(address);
    }
    Ok(addresses)
}

/// A rejecting filter and two finallies sit between the throw and a typed catch two frames up.
#[test]
fn test_rejecting_filter_then_typed_catch() -> Result<()> {
    let mut universe = universe()?;
    let tables = map_tables(
        &mut universe.memory,
        &[
            ClauseTableBuilder::new().clause(EHClause::fault(0x10, 0x20, 0xA0)),
            ClauseTableBuilder::new()
                .clause(EHClause::filter(0x20, 0x40, 0x80, 0x70))
                .clause(EHClause::fault(0x20, 0x40, 0x90)),
            ClauseTableBuilder::new().clause(EHClause::typed(
                0x00,
                0x20,
                0xE0,
                symbol(universe.exception),
                0,
            )),
        ],
    )?;

    let frames = vec![
        FrameInfo::new(0x1000, 0x18, tables[0]),
        FrameInfo::new(0x2000, 0x30, tables[1]),
        FrameInfo::new(0x3000, 0x10, tables[2]),
    ];
    let mut walker = ShadowStackWalker::new(frames.clone());
    let mut dispatcher = ExceptionDispatcher::new(
        &universe.memory,
        ScriptedCallbacks::new(universe.argument_exception),
    );

    let transfer = dispatcher.dispatch(&mut walker, THROWN, MAX_TRY_REGION_IDX)?;
    assert_eq!(transfer.frame_index, 2);
    assert_eq!(transfer.frame, frames[2]);
    assert_eq!(transfer.handler_address, 0x30E0);
    assert_eq!(transfer.try_region_idx, 0);
    assert_eq!(dispatcher.state(), DispatchState::TransferredToHandler);

    // The filter runs during the search, every finally after it.
    assert_eq!(
        dispatcher.callbacks().log,
        vec![
            Funclet::Filter(0x2070),
            Funclet::Finally(0x10A0),
            Funclet::Finally(0x2090),
        ]
    );
    Ok(())
}

/// An accepting filter wins over a typed catch further out in the same frame.
#[test]
fn test_accepting_filter_wins() -> Result<()> {
    let mut universe = universe()?;
    let tables = map_tables(
        &mut universe.memory,
        &[ClauseTableBuilder::new()
            .clause(EHClause::filter(0x10, 0x30, 0x80, 0x60))
            .clause(EHClause::typed(0x00, 0x40, 0xC0, symbol(universe.object), 0))],
    )?;

    let mut callbacks = ScriptedCallbacks::new(universe.format_exception);
    callbacks.accepting_filters.push(0x1060);
    let mut dispatcher = ExceptionDispatcher::new(&universe.memory, callbacks);
    let mut walker = ShadowStackWalker::new(vec![FrameInfo::new(0x1000, 0x18, tables[0])]);

    let transfer = dispatcher.dispatch(&mut walker, THROWN, MAX_TRY_REGION_IDX)?;
    assert_eq!(transfer.handler_address, 0x1080);
    assert_eq!(transfer.try_region_idx, 0);
    assert!(dispatcher.callbacks().finallies().is_empty());
    Ok(())
}

/// A catch for an unrelated exception type never matches, so the exception escapes.
#[test]
fn test_unrelated_catch_leaves_exception_unhandled() -> Result<()> {
    let mut universe = universe()?;
    let tables = map_tables(
        &mut universe.memory,
        &[ClauseTableBuilder::new()
            .clause(EHClause::typed(
                0x00,
                0x40,
                0xC0,
                symbol(universe.argument_exception),
                0,
            ))
            .clause(EHClause::fault(0x00, 0x40, 0xD0))],
    )?;

    let mut dispatcher = ExceptionDispatcher::new(
        &universe.memory,
        ScriptedCallbacks::new(universe.format_exception),
    );
    let mut walker = ShadowStackWalker::new(vec![
        FrameInfo::new(0x1000, 0x18, tables[0]),
        FrameInfo::new(0x2000, 0x08, 0),
    ]);

    let error = dispatcher
        .dispatch(&mut walker, THROWN, MAX_TRY_REGION_IDX)
        .unwrap_err();
    assert!(matches!(
        error,
        Error::UnhandledException { frames: 2, .. }
    ));
    assert!(error.is_fatal());
    assert_eq!(dispatcher.state(), DispatchState::Unhandled);
    // Nothing unwinds without a handler.
    assert!(dispatcher.callbacks().log.is_empty());
    Ok(())
}

/// Sibling try regions of one frame each catch only what is thrown inside them.
#[test]
fn test_sibling_try_regions() -> Result<()> {
    let mut universe = universe()?;
    let tables = map_tables(
        &mut universe.memory,
        &[ClauseTableBuilder::new()
            .clause(EHClause::fault(0, 10, 0xA0))
            .clause(EHClause::typed(
                0,
                10,
                0x80,
                symbol(universe.argument_exception),
                0,
            ))
            .clause(EHClause::typed(
                10,
                20,
                0x90,
                symbol(universe.format_exception),
                0,
            ))],
    )?;
    let dispatch = |exception_type: u64, offset: u32| {
        let mut dispatcher =
            ExceptionDispatcher::new(&universe.memory, ScriptedCallbacks::new(exception_type));
        let mut walker = ShadowStackWalker::new(vec![FrameInfo::new(0x1000, offset, tables[0])]);
        let transfer = dispatcher.dispatch(&mut walker, THROWN, MAX_TRY_REGION_IDX);
        (transfer, dispatcher.callbacks().finallies())
    };

    let (transfer, finallies) = dispatch(universe.argument_exception, 5);
    let transfer = transfer?;
    assert_eq!(transfer.handler_address, 0x1080);
    assert_eq!(transfer.try_region_idx, 1);
    assert_eq!(finallies, vec![0x10A0]);

    // The finally guarding the first region does not run for the second.
    let (transfer, finallies) = dispatch(universe.format_exception, 15);
    let transfer = transfer?;
    assert_eq!(transfer.handler_address, 0x1090);
    assert_eq!(transfer.try_region_idx, 2);
    assert!(finallies.is_empty());

    // Each catch only sees its own region, and the end offset is exclusive.
    for (exception_type, offset) in [
        (universe.argument_exception, 15),
        (universe.argument_exception, 10),
        (universe.format_exception, 5),
        (universe.format_exception, 25),
    ] {
        let (transfer, finallies) = dispatch(exception_type, offset);
        assert!(
            matches!(transfer, Err(Error::UnhandledException { .. })),
            "offset {offset} was handled"
        );
        assert!(finallies.is_empty());
    }
    Ok(())
}

/// Nested finallies run innermost first, frame by frame, and a sibling region is skipped.
#[test]
fn test_nested_finallies_run_inside_out() -> Result<()> {
    let mut universe = universe()?;
    let tables = map_tables(
        &mut universe.memory,
        &[
            ClauseTableBuilder::new()
                .clause(EHClause::fault(5, 10, 0xA0))
                .clause(EHClause::fault(10, 20, 0xE0))
                .clause(EHClause::fault(0, 10, 0xB0)),
            ClauseTableBuilder::new()
                .clause(EHClause::fault(0x08, 0x18, 0xD0))
                .clause(EHClause::typed(0x00, 0x40, 0xC0, symbol(universe.object), 0))
                .clause(EHClause::fault(0x00, 0x40, 0xF0)),
        ],
    )?;

    let frames = vec![
        FrameInfo::new(0x1000, 7, tables[0]),
        FrameInfo::new(0x2000, 0x10, tables[1]),
    ];
    let mut walker = ShadowStackWalker::new(frames);
    let mut dispatcher =
        ExceptionDispatcher::new(&universe.memory, ScriptedCallbacks::new(universe.exception));

    let transfer = dispatcher.dispatch(&mut walker, THROWN, MAX_TRY_REGION_IDX)?;
    assert_eq!(transfer.frame_index, 1);
    assert_eq!(transfer.handler_address, 0x20C0);
    assert_eq!(transfer.try_region_idx, 1);

    // The fault enclosing the catch belongs to the handler's own try region and stays pending.
    assert_eq!(
        dispatcher.callbacks().finallies(),
        vec![0x10A0, 0x10B0, 0x20D0]
    );
    Ok(())
}

/// A filter that throws is a fail-fast, and so is a finally that throws.
#[test]
fn test_escaping_funclets_fail_fast() -> Result<()> {
    let mut universe = universe()?;
    let tables = map_tables(
        &mut universe.memory,
        &[
            ClauseTableBuilder::new().clause(EHClause::filter(0x00, 0x40, 0x80, 0x60)),
            ClauseTableBuilder::new()
                .clause(EHClause::fault(0x00, 0x20, 0x90))
                .clause(EHClause::typed(0x00, 0x40, 0xC0, symbol(universe.object), 0)),
        ],
    )?;

    let mut callbacks = ScriptedCallbacks::new(universe.exception);
    callbacks.failing_funclets.push(0x1060);
    let mut dispatcher = ExceptionDispatcher::new(&universe.memory, callbacks);
    let mut walker = ShadowStackWalker::new(vec![FrameInfo::new(0x1000, 0x10, tables[0])]);
    let error = dispatcher
        .dispatch(&mut walker, THROWN, MAX_TRY_REGION_IDX)
        .unwrap_err();
    assert!(matches!(
        error,
        Error::FailFast(FailFastReason::ExceptionDuringFilter)
    ));
    assert_eq!(dispatcher.state(), DispatchState::Idle);

    let mut callbacks = ScriptedCallbacks::new(universe.exception);
    callbacks.failing_funclets.push(0x2090);
    let mut dispatcher = ExceptionDispatcher::new(&universe.memory, callbacks);
    let mut walker = ShadowStackWalker::new(vec![FrameInfo::new(0x2000, 0x10, tables[1])]);
    let error = dispatcher
        .dispatch(&mut walker, THROWN, MAX_TRY_REGION_IDX)
        .unwrap_err();
    assert!(matches!(
        error,
        Error::FailFast(FailFastReason::ExceptionDuringUnwind)
    ));
    assert_eq!(dispatcher.callbacks().finallies(), vec![0x2090]);
    Ok(())
}

/// The per-frame passes can be driven directly from a clause table.
#[test]
fn test_single_frame_passes() -> Result<()> {
    let universe = universe()?;
    let table = ClauseTableBuilder::new()
        .clause(EHClause::fault(0x10, 0x20, 0xA0))
        .clause(EHClause::unused(0x10, 0x20))
        .clause(EHClause::typed(0x10, 0x30, 0xB0, symbol(universe.exception), 0x7_7000))
        .encode();

    let decoded: Vec<EHClause> = EHClauseIterator::new(&table)?.collect::<Result<_>>()?;
    assert_eq!(decoded.len(), 3);
    assert_eq!(decoded[1].kind, ClauseKind::Unused);
    assert_eq!(decoded[2].handler_function, 0x7_7000);

    let mut callbacks = ScriptedCallbacks::new(universe.argument_exception);
    let handler = find_first_pass_handler(
        &universe.memory,
        &mut callbacks,
        THROWN,
        MAX_TRY_REGION_IDX,
        0x14,
        0,
        0x1000,
        EHClauseIterator::new(&table)?,
    )?;
    assert_eq!(
        handler,
        Some(FirstPassHandler {
            handler_address: 0x7_7000,
            try_region_idx: 2,
        })
    );

    let run = invoke_second_pass(
        &mut callbacks,
        MAX_TRY_REGION_IDX,
        0x10,
        EHClauseIterator::new(&table)?,
        2,
        0,
        0x1000,
    )?;
    assert_eq!(run, 1);
    assert_eq!(callbacks.finallies(), vec![0x10A0]);
    Ok(())
}
