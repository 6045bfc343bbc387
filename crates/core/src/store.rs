//! Variable storage
//!
//! Variables live in parallel tables: a name table and a slot table per
//! kind. Program variables share one name table; a name may have a global
//! slot (same index as the name) and, independently, static or local
//! incarnations inside functions. User variables are a separate name/slot
//! pair that survives program clears. Local and parameter slots are owned
//! by call frames (in the engine crate) and only their arrays live here,
//! in the shared array arena.

use crate::accounting::{HeapAudit, StringClass};
use crate::value::{Value, ValueType};
use crate::{MAX_ARRAY_DIMS, MAX_ARRAY_ELEM, MAX_PROG_VARS, MAX_USER_VARS};

bitflags::bitflags! {
    /// Attribute flags of one variable slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VarAttr: u8 {
        const IS_ARRAY         = 0x01;
        const IS_CONST         = 0x02;
        /// Set on a program variable *name* that owns a global slot
        const HAS_GLOBAL_VALUE = 0x04;
        /// User variable referenced by the parsed program (blocks delete)
        const USED_BY_PROGRAM  = 0x08;
        /// User variable promoted into function scope by a `#` reference
        const FORCED_FUNC_VAR  = 0x10;
    }
}

/// Scope of a variable reference, as recorded in variable-reference tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Scope {
    User = 0,
    Global = 1,
    Static = 2,
    Local = 3,
    Param = 4,
}

impl Scope {
    pub fn from_u8(v: u8) -> Option<Scope> {
        match v {
            0 => Some(Scope::User),
            1 => Some(Scope::Global),
            2 => Some(Scope::Static),
            3 => Some(Scope::Local),
            4 => Some(Scope::Param),
            _ => None,
        }
    }

    /// Accounting category for string values in this scope.
    pub fn string_class(self) -> StringClass {
        match self {
            Scope::User => StringClass::UserVarStr,
            Scope::Global | Scope::Static => StringClass::GlobalStaticVarStr,
            Scope::Local | Scope::Param => StringClass::LocalVarStr,
        }
    }

    /// Accounting category for array storage in this scope.
    pub fn array_class(self) -> StringClass {
        match self {
            Scope::User => StringClass::UserArray,
            Scope::Global | Scope::Static => StringClass::GlobalStaticArray,
            Scope::Local | Scope::Param => StringClass::LocalArray,
        }
    }
}

/// One variable slot: a value plus its attribute flags.
#[derive(Debug, Clone, Default)]
pub struct Slot {
    pub value: Option<Value>,
    pub attrs: VarAttr,
}

impl Slot {
    pub fn new(value: Value, attrs: VarAttr) -> Self {
        Slot {
            value: Some(value),
            attrs,
        }
    }
}

/// Handle into the array arena.
pub type ArrayId = usize;

/// Contiguous array storage. The element type (numeric vs string) is fixed
/// at declaration; numeric elements coerce long<->float on assignment.
#[derive(Debug, Clone)]
pub struct ArrayStorage {
    pub dims: [u8; MAX_ARRAY_DIMS],
    pub dim_count: u8,
    pub string_elems: bool,
    pub elems: Vec<Value>,
}

impl ArrayStorage {
    /// Allocate numeric array storage, broadcasting `init` to all elements.
    pub fn new_numeric(dims: &[u8], init: Value) -> Result<ArrayStorage, ArrayDefError> {
        let (dims, dim_count, count) = Self::check_dims(dims)?;
        debug_assert!(init.is_numeric());
        Ok(ArrayStorage {
            dims,
            dim_count,
            string_elems: false,
            elems: vec![init; count],
        })
    }

    /// Allocate string array storage; string arrays always start empty.
    pub fn new_string(dims: &[u8]) -> Result<ArrayStorage, ArrayDefError> {
        let (dims, dim_count, count) = Self::check_dims(dims)?;
        Ok(ArrayStorage {
            dims,
            dim_count,
            string_elems: true,
            elems: vec![Value::Str(None); count],
        })
    }

    fn check_dims(dims: &[u8]) -> Result<([u8; MAX_ARRAY_DIMS], u8, usize), ArrayDefError> {
        if dims.is_empty() || dims.len() > MAX_ARRAY_DIMS {
            return Err(ArrayDefError::DimCount);
        }
        let mut out = [0u8; MAX_ARRAY_DIMS];
        let mut count: usize = 1;
        for (i, &d) in dims.iter().enumerate() {
            if d == 0 {
                return Err(ArrayDefError::DimSize);
            }
            out[i] = d;
            count *= d as usize;
        }
        if count > MAX_ARRAY_ELEM {
            return Err(ArrayDefError::TooManyElements);
        }
        Ok((out, dims.len() as u8, count))
    }

    pub fn dim_count(&self) -> usize {
        self.dim_count as usize
    }

    /// Upper bound of one dimension (1-based dimension number).
    pub fn ubound(&self, dim: usize) -> Option<i32> {
        if dim >= 1 && dim <= self.dim_count as usize {
            Some(self.dims[dim - 1] as i32)
        } else {
            None
        }
    }

    /// Row-major flat index from 1-based subscripts.
    pub fn flat_index(&self, subs: &[i32]) -> Option<usize> {
        if subs.len() != self.dim_count as usize {
            return None;
        }
        let mut idx: usize = 0;
        for (i, &s) in subs.iter().enumerate() {
            let extent = self.dims[i] as i32;
            if s < 1 || s > extent {
                return None;
            }
            idx = idx * extent as usize + (s - 1) as usize;
        }
        Some(idx)
    }

    /// Element type tag of this array.
    pub fn elem_type(&self) -> ValueType {
        if self.string_elems {
            ValueType::Str
        } else {
            // Mixed long/float storage is allowed; report by first element
            match self.elems.first() {
                Some(Value::Float(_)) => ValueType::Float,
                _ => ValueType::Long,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayDefError {
    DimCount,
    DimSize,
    TooManyElements,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    TableFull,
    Redeclared,
    UsedByProgram,
}

/// Program, user and static variable storage plus the array arena.
#[derive(Debug, Default)]
pub struct VarStore {
    /// Program variable names (index doubles as global slot index)
    prog_names: Vec<Box<str>>,
    /// Per-name attributes (HAS_GLOBAL_VALUE lives here)
    prog_name_attrs: Vec<VarAttr>,
    /// Global slots, parallel to `prog_names`
    global_slots: Vec<Slot>,
    /// Static slots, appended in parse order; function descriptors record
    /// their base index and count
    static_slots: Vec<Slot>,
    /// User variable names
    user_names: Vec<Box<str>>,
    /// User slots, parallel to `user_names`
    user_slots: Vec<Slot>,
    /// Array arena; freed entries become `None`
    arrays: Vec<Option<ArrayStorage>>,
}

impl VarStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- program variable names and global slots ---

    pub fn find_prog_name(&self, name: &str) -> Option<usize> {
        self.prog_names.iter().position(|n| n.as_ref() == name)
    }

    pub fn prog_name(&self, index: usize) -> &str {
        &self.prog_names[index]
    }

    pub fn prog_name_count(&self) -> usize {
        self.prog_names.len()
    }

    pub fn prog_name_attrs(&self, index: usize) -> VarAttr {
        self.prog_name_attrs[index]
    }

    pub fn set_prog_name_attrs(&mut self, index: usize, attrs: VarAttr) {
        self.prog_name_attrs[index] = attrs;
    }

    /// Intern a program variable name. The matching global slot starts
    /// empty; declaring `var` at global scope fills it in.
    pub fn add_prog_name(&mut self, name: &str, audit: &mut HeapAudit) -> Result<usize, StoreError> {
        if self.prog_names.len() >= MAX_PROG_VARS {
            return Err(StoreError::TableFull);
        }
        audit.on_create(StringClass::ProgVarName);
        self.prog_names.push(name.into());
        self.prog_name_attrs.push(VarAttr::empty());
        self.global_slots.push(Slot::default());
        Ok(self.prog_names.len() - 1)
    }

    pub fn global_slot(&self, index: usize) -> &Slot {
        &self.global_slots[index]
    }

    pub fn global_slot_mut(&mut self, index: usize) -> &mut Slot {
        &mut self.global_slots[index]
    }

    // --- static slots ---

    pub fn static_count(&self) -> usize {
        self.static_slots.len()
    }

    pub fn push_static(&mut self, slot: Slot) -> usize {
        self.static_slots.push(slot);
        self.static_slots.len() - 1
    }

    pub fn static_slot(&self, index: usize) -> &Slot {
        &self.static_slots[index]
    }

    pub fn static_slot_mut(&mut self, index: usize) -> &mut Slot {
        &mut self.static_slots[index]
    }

    // --- user variables ---

    pub fn find_user_name(&self, name: &str) -> Option<usize> {
        self.user_names.iter().position(|n| n.as_ref() == name)
    }

    pub fn user_name(&self, index: usize) -> &str {
        &self.user_names[index]
    }

    pub fn user_count(&self) -> usize {
        self.user_names.len()
    }

    pub fn add_user_var(
        &mut self,
        name: &str,
        slot: Slot,
        audit: &mut HeapAudit,
    ) -> Result<usize, StoreError> {
        if self.find_user_name(name).is_some() {
            return Err(StoreError::Redeclared);
        }
        if self.user_names.len() >= MAX_USER_VARS {
            return Err(StoreError::TableFull);
        }
        audit.on_create(StringClass::UserVarName);
        self.user_names.push(name.into());
        self.user_slots.push(slot);
        Ok(self.user_names.len() - 1)
    }

    pub fn user_slot(&self, index: usize) -> &Slot {
        &self.user_slots[index]
    }

    pub fn user_slot_mut(&mut self, index: usize) -> &mut Slot {
        &mut self.user_slots[index]
    }

    /// Delete one user variable. Refused while the parsed program
    /// references it. Frees the name, the string value or the array
    /// storage (string elements first), and shifts later entries down.
    /// The removed index is returned so the caller can renumber
    /// variable-reference tokens.
    pub fn delete_user_var(
        &mut self,
        index: usize,
        audit: &mut HeapAudit,
    ) -> Result<usize, StoreError> {
        let slot = &self.user_slots[index];
        if slot.attrs.contains(VarAttr::USED_BY_PROGRAM) {
            return Err(StoreError::UsedByProgram);
        }
        let slot = self.user_slots.remove(index);
        self.release_slot_value(slot, Scope::User, audit);
        self.user_names.remove(index);
        audit.on_destroy(StringClass::UserVarName);
        Ok(index)
    }

    /// Clear all user variables (full machine reset).
    pub fn clear_user_vars(&mut self, audit: &mut HeapAudit) {
        while let Some(slot) = self.user_slots.pop() {
            self.release_slot_value(slot, Scope::User, audit);
            self.user_names.pop();
            audit.on_destroy(StringClass::UserVarName);
        }
    }

    /// Clear program variables, globals and statics (program clear).
    /// User variables lose their USED_BY_PROGRAM mark.
    pub fn clear_program_vars(&mut self, audit: &mut HeapAudit) {
        while let Some(slot) = self.global_slots.pop() {
            self.release_slot_value(slot, Scope::Global, audit);
        }
        while let Some(slot) = self.static_slots.pop() {
            self.release_slot_value(slot, Scope::Static, audit);
        }
        for _ in 0..self.prog_names.len() {
            audit.on_destroy(StringClass::ProgVarName);
        }
        self.prog_names.clear();
        self.prog_name_attrs.clear();
        for slot in &mut self.user_slots {
            slot.attrs.remove(VarAttr::USED_BY_PROGRAM);
        }
    }

    /// Drop a slot's owned value, tallying string / array destruction in
    /// the scope's categories.
    pub fn release_slot_value(&mut self, slot: Slot, scope: Scope, audit: &mut HeapAudit) {
        match slot.value {
            Some(Value::Str(Some(_))) => audit.on_destroy(scope.string_class()),
            Some(Value::Array(id)) => self.free_array(id, scope, audit),
            _ => {}
        }
    }

    // --- scalar assignment ---

    /// Replace a slot's scalar value. The old string (if any) is freed
    /// under the scope's category; the incoming value is adopted and
    /// counted there when it carries a string.
    pub fn assign_scalar(slot: &mut Slot, value: Value, scope: Scope, audit: &mut HeapAudit) {
        if let Some(Value::Str(Some(_))) = slot.value {
            audit.on_destroy(scope.string_class());
        }
        if let Value::Str(Some(_)) = value {
            audit.on_create(scope.string_class());
        }
        slot.value = Some(value);
    }

    // --- arrays ---

    pub fn alloc_array(
        &mut self,
        storage: ArrayStorage,
        scope: Scope,
        audit: &mut HeapAudit,
    ) -> ArrayId {
        audit.on_create(scope.array_class());
        if let Some(free) = self.arrays.iter().position(Option::is_none) {
            self.arrays[free] = Some(storage);
            free
        } else {
            self.arrays.push(Some(storage));
            self.arrays.len() - 1
        }
    }

    pub fn array(&self, id: ArrayId) -> Option<&ArrayStorage> {
        self.arrays.get(id).and_then(Option::as_ref)
    }

    pub fn array_mut(&mut self, id: ArrayId) -> Option<&mut ArrayStorage> {
        self.arrays.get_mut(id).and_then(Option::as_mut)
    }

    /// Free array storage: element strings one by one, then the block.
    pub fn free_array(&mut self, id: ArrayId, scope: Scope, audit: &mut HeapAudit) {
        if let Some(storage) = self.arrays.get_mut(id).and_then(Option::take) {
            if storage.string_elems {
                for elem in &storage.elems {
                    if matches!(elem, Value::Str(Some(_))) {
                        audit.on_destroy(scope.string_class());
                    }
                }
            }
            audit.on_destroy(scope.array_class());
        }
    }

    /// Assign one array element. Numeric arrays coerce long<->float;
    /// numeric<->string mismatches are refused (the caller reports
    /// array-value-type-fixed).
    pub fn assign_array_elem(
        &mut self,
        id: ArrayId,
        subs: &[i32],
        value: Value,
        scope: Scope,
        audit: &mut HeapAudit,
    ) -> Result<(), ArrayAssignError> {
        let storage = self
            .arrays
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or(ArrayAssignError::BadSubscript)?;
        let idx = storage
            .flat_index(subs)
            .ok_or(ArrayAssignError::BadSubscript)?;
        match (&value, storage.string_elems) {
            (Value::Str(_), true) => {
                if matches!(storage.elems[idx], Value::Str(Some(_))) {
                    audit.on_destroy(scope.string_class());
                }
                if matches!(value, Value::Str(Some(_))) {
                    audit.on_create(scope.string_class());
                }
                storage.elems[idx] = value;
                Ok(())
            }
            (Value::Long(_) | Value::Float(_), false) => {
                storage.elems[idx] = value;
                Ok(())
            }
            _ => Err(ArrayAssignError::TypeFixed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayAssignError {
    BadSubscript,
    TypeFixed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_dims_bounds() {
        assert!(ArrayStorage::new_numeric(&[255], Value::Long(0)).is_ok());
        assert!(matches!(
            ArrayStorage::new_numeric(&[20, 20, 20], Value::Long(0)),
            Err(ArrayDefError::TooManyElements)
        ));
        assert!(matches!(
            ArrayStorage::new_numeric(&[], Value::Long(0)),
            Err(ArrayDefError::DimCount)
        ));
        assert!(matches!(
            ArrayStorage::new_numeric(&[2, 0], Value::Long(0)),
            Err(ArrayDefError::DimSize)
        ));
    }

    #[test]
    fn test_flat_index_row_major() {
        let a = ArrayStorage::new_numeric(&[3, 4], Value::Long(0)).unwrap();
        assert_eq!(a.flat_index(&[1, 1]), Some(0));
        assert_eq!(a.flat_index(&[1, 4]), Some(3));
        assert_eq!(a.flat_index(&[2, 1]), Some(4));
        assert_eq!(a.flat_index(&[3, 4]), Some(11));
        assert_eq!(a.flat_index(&[0, 1]), None);
        assert_eq!(a.flat_index(&[3, 5]), None);
        assert_eq!(a.flat_index(&[1]), None);
    }

    #[test]
    fn test_numeric_array_coerces_string_refused() {
        let mut store = VarStore::new();
        let mut audit = HeapAudit::new();
        let storage = ArrayStorage::new_numeric(&[2], Value::Long(0)).unwrap();
        let id = store.alloc_array(storage, Scope::Global, &mut audit);

        store
            .assign_array_elem(id, &[1], Value::Float(2.5), Scope::Global, &mut audit)
            .unwrap();
        assert_eq!(store.array(id).unwrap().elems[0], Value::Float(2.5));

        let err = store
            .assign_array_elem(id, &[2], Value::str_from("x"), Scope::Global, &mut audit)
            .unwrap_err();
        assert_eq!(err, ArrayAssignError::TypeFixed);
    }

    #[test]
    fn test_user_var_lifecycle_balances_audit() {
        let mut store = VarStore::new();
        let mut audit = HeapAudit::new();

        let idx = store
            .add_user_var(
                "s",
                Slot::new(Value::Str(None), VarAttr::empty()),
                &mut audit,
            )
            .unwrap();
        VarStore::assign_scalar(
            store.user_slot_mut(idx),
            Value::str_from("hello"),
            Scope::User,
            &mut audit,
        );
        store.delete_user_var(idx, &mut audit).unwrap();

        assert!(audit.all_balanced());
    }

    #[test]
    fn test_delete_refused_when_program_references() {
        let mut store = VarStore::new();
        let mut audit = HeapAudit::new();
        let idx = store
            .add_user_var(
                "v",
                Slot::new(Value::Long(1), VarAttr::USED_BY_PROGRAM),
                &mut audit,
            )
            .unwrap();
        assert_eq!(
            store.delete_user_var(idx, &mut audit),
            Err(StoreError::UsedByProgram)
        );
    }

    #[test]
    fn test_delete_shifts_following_entries() {
        let mut store = VarStore::new();
        let mut audit = HeapAudit::new();
        store
            .add_user_var("a", Slot::new(Value::Long(1), VarAttr::empty()), &mut audit)
            .unwrap();
        store
            .add_user_var("b", Slot::new(Value::Long(2), VarAttr::empty()), &mut audit)
            .unwrap();
        store
            .add_user_var("c", Slot::new(Value::Long(3), VarAttr::empty()), &mut audit)
            .unwrap();

        store.delete_user_var(1, &mut audit).unwrap();
        assert_eq!(store.find_user_name("c"), Some(1));
        assert_eq!(store.user_count(), 2);
    }

    #[test]
    fn test_string_array_starts_empty_and_frees_elements() {
        let mut store = VarStore::new();
        let mut audit = HeapAudit::new();
        let storage = ArrayStorage::new_string(&[3]).unwrap();
        let id = store.alloc_array(storage, Scope::User, &mut audit);

        store
            .assign_array_elem(id, &[2], Value::str_from("mid"), Scope::User, &mut audit)
            .unwrap();
        store.free_array(id, Scope::User, &mut audit);
        assert!(audit.all_balanced());
    }
}
