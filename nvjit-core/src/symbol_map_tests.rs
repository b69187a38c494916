use crate::ir::SymbolId;
use crate::symbol_map::{AddrRange, SymbolMap, ACCESS_READ, ACCESS_WRITE};

#[test]
fn test_slots_are_dense_and_stable() {
    let mut map = SymbolMap::new();
    assert_eq!(map.assign_parameter_slot(SymbolId(4), 4, None), 0);
    assert_eq!(map.assign_parameter_slot(SymbolId(7), -1, None), 1);
    // Mapping a symbol twice keeps its first slot.
    assert_eq!(map.assign_parameter_slot(SymbolId(4), 4, None), 0);
    assert_eq!(map.next_slot(), 2);
    assert_eq!(map.parameter_symbols(), vec![SymbolId(4), SymbolId(7)]);
    assert!(map.get(SymbolId(4)).expect("unmapped").is_array());
    assert!(!map.get(SymbolId(7)).expect("unmapped").is_array());
}

#[test]
fn test_autos_stay_out_of_parameters() {
    let mut map = SymbolMap::new();
    map.map_auto(SymbolId(1));
    map.map_auto(SymbolId(2));
    map.map_auto(SymbolId(1));
    assert_eq!(map.autos, vec![SymbolId(1), SymbolId(2)]);
    assert_eq!(map.slot(SymbolId(1)), None);
    assert_eq!(map.auto_index(SymbolId(2)), Some(1));
    assert!(map.parameters().is_empty());
    assert_eq!(map.len(), 2);
}

#[test]
fn test_promoting_an_auto_to_parameter() {
    let mut map = SymbolMap::new();
    map.assign_parameter_slot(SymbolId(0), -1, None);
    map.map_auto(SymbolId(3));
    assert_eq!(map.slot(SymbolId(3)), None);
    assert_eq!(map.assign_parameter_slot(SymbolId(3), -1, None), 1);
    assert_eq!(map.slot(SymbolId(3)), Some(1));
}

#[test]
fn test_access_bits_and_ranges() {
    let mut map = SymbolMap::new();
    map.assign_parameter_slot(SymbolId(9), 8, None);
    let entry = map.get_mut(SymbolId(9)).expect("unmapped");
    assert_eq!(entry.rhs, AddrRange::NotYetSeen);
    entry.access |= ACCESS_READ;
    entry.rhs = AddrRange::Invalid;
    let entry = map.get(SymbolId(9)).expect("unmapped");
    assert!(entry.reads());
    assert!(!entry.writes());
    assert_eq!(entry.rhs.expr(), None);
    assert_eq!(entry.access & ACCESS_WRITE, 0);
}

#[test]
fn test_clear_resets_slots() {
    let mut map = SymbolMap::new();
    map.assign_parameter_slot(SymbolId(0), -1, None);
    map.map_auto(SymbolId(1));
    map.clear();
    assert!(map.is_empty());
    assert!(map.autos.is_empty());
    assert_eq!(map.assign_parameter_slot(SymbolId(5), -1, None), 0);
}
