//! The tagged dynamic value and its coercion rules.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use phlox_asm::Literal;

use crate::array::Hashmap;
use crate::class::Instance;
use crate::reftable::{RefTable, SlotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The declared type of a value: the most recently assigned
/// representation.
pub enum Tag {
    /// The null value.
    Null,
    /// A boolean in the integer cell.
    Bool,
    /// An integer in the integer cell.
    Int,
    /// A real in the real cell.
    Real,
    /// A byte string in the blob.
    Str,
    /// An array payload.
    Array,
    /// An object payload.
    Object,
    /// An opaque resource handle in the integer cell.
    Resource,
}

impl Tag {
    const fn rep(self) -> Rep {
        match self {
            Tag::Null => Rep::NULL,
            Tag::Bool => Rep::BOOL,
            Tag::Int => Rep::INT,
            Tag::Real => Rep::REAL,
            Tag::Str => Rep::STR,
            Tag::Array => Rep::ARRAY,
            Tag::Object => Rep::OBJECT,
            Tag::Resource => Rep::RESOURCE,
        }
    }

    const fn order(self) -> u8 {
        self.rep().bits() as u8
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// Representation bits of a value.
    ///
    /// The `valid` set of a [`Value`] may carry several bits at once when
    /// cached conversions are still coherent: an integer formatted to a
    /// string keeps both `INT` and `STR` until the next store.
    pub struct Rep: u16 {
        /// The null representation.
        const NULL = 1 << 0;
        /// A boolean in the integer cell.
        const BOOL = 1 << 1;
        /// An integer in the integer cell.
        const INT = 1 << 2;
        /// A real in the real cell.
        const REAL = 1 << 3;
        /// A byte string in the blob.
        const STR = 1 << 4;
        /// An array payload.
        const ARRAY = 1 << 5;
        /// An object payload.
        const OBJECT = 1 << 6;
        /// An opaque resource handle in the integer cell.
        const RESOURCE = 1 << 7;
        /// A reference marker: the integer cell carries a slot index for
        /// `StoreIdxRef`.
        const REF = 1 << 8;
    }
}

/// Pointer-to-other payload of aggregate values.
#[derive(Debug, Clone, Default)]
pub enum Aux {
    /// No aggregate payload.
    #[default]
    None,
    /// A shared array.
    Array(Rc<RefCell<Hashmap>>),
    /// A shared object instance.
    Object(Rc<RefCell<Instance>>),
}

/// Result of a numeric string parse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    /// No fractional or exponent part appeared.
    Int(i64),
    /// The parse consumed a `.` or exponent.
    Real(f64),
}

impl Numeric {
    /// The parsed value as an integer, truncating reals toward zero.
    pub fn as_int(self) -> i64 {
        match self {
            Self::Int(i) => i,
            Self::Real(r) => r as i64,
        }
    }

    /// The parsed value as a real.
    pub fn as_real(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Real(r) => r,
        }
    }
}

#[derive(Debug, Clone)]
/// A dynamic value.
///
/// Values on the operand stack are views: copying one copies the cells and
/// shares the aggregate payload, and the `slot` field remembers which
/// reference-table slot the value was loaded from (or [`SlotId::INVALID`]
/// for literals and unbound temporaries, which are not addressable for
/// aliasing).
pub struct Value {
    tag: Tag,
    valid: Rep,
    ival: i64,
    rval: f64,
    blob: Vec<u8>,
    aux: Aux,
    pub(crate) slot: SlotId,
}

impl Default for Value {
    fn default() -> Self {
        Self {
            tag: Tag::Null,
            valid: Rep::NULL,
            ival: 0,
            rval: 0.0,
            blob: Vec::new(),
            aux: Aux::None,
            slot: SlotId::INVALID,
        }
    }
}

impl PartialEq for Value {
    /// Shallow structural equality: scalar payloads by value, aggregates
    /// by identity. Script-level comparison goes through
    /// [`Value::compare`], which can chase slots.
    fn eq(&self, other: &Self) -> bool {
        if self.tag != other.tag {
            return false;
        }
        match self.tag {
            Tag::Null => true,
            Tag::Bool | Tag::Int | Tag::Resource => self.ival == other.ival,
            Tag::Real => self.rval == other.rval,
            Tag::Str => self.blob == other.blob,
            Tag::Array => match (&self.aux, &other.aux) {
                (Aux::Array(a), Aux::Array(b)) => Rc::ptr_eq(a, b),
                _ => false,
            },
            Tag::Object => match (&self.aux, &other.aux) {
                (Aux::Object(a), Aux::Object(b)) => Rc::ptr_eq(a, b),
                _ => false,
            },
        }
    }
}

impl Value {
    /// The null value.
    pub fn null() -> Self {
        Self::default()
    }

    /// A boolean value.
    pub fn bool(b: bool) -> Self {
        Self {
            tag: Tag::Bool,
            valid: Rep::BOOL,
            ival: b as i64,
            ..Self::default()
        }
    }

    /// An integer value.
    pub fn int(i: i64) -> Self {
        Self {
            tag: Tag::Int,
            valid: Rep::INT,
            ival: i,
            ..Self::default()
        }
    }

    /// A real value.
    pub fn real(r: f64) -> Self {
        Self {
            tag: Tag::Real,
            valid: Rep::REAL,
            rval: r,
            ..Self::default()
        }
    }

    /// A string value from UTF-8 text.
    pub fn str(s: impl AsRef<str>) -> Self {
        Self::bytes(s.as_ref().as_bytes().to_vec())
    }

    /// A string value from raw bytes.
    pub fn bytes(blob: Vec<u8>) -> Self {
        Self {
            tag: Tag::Str,
            valid: Rep::STR,
            blob,
            ..Self::default()
        }
    }

    /// An array value sharing the given map.
    pub fn array(map: Rc<RefCell<Hashmap>>) -> Self {
        Self {
            tag: Tag::Array,
            valid: Rep::ARRAY,
            aux: Aux::Array(map),
            ..Self::default()
        }
    }

    /// An object value sharing the given instance.
    pub fn object(instance: Rc<RefCell<Instance>>) -> Self {
        Self {
            tag: Tag::Object,
            valid: Rep::OBJECT,
            aux: Aux::Object(instance),
            ..Self::default()
        }
    }

    /// An opaque resource handle.
    pub fn resource(handle: i64) -> Self {
        Self {
            tag: Tag::Resource,
            valid: Rep::RESOURCE,
            ival: handle,
            ..Self::default()
        }
    }

    /// Materialize a compile-time literal.
    pub fn from_literal(literal: &Literal) -> Self {
        match literal {
            Literal::Null => Self::null(),
            Literal::Bool(b) => Self::bool(*b),
            Literal::Int(i) => Self::int(*i),
            Literal::Real(r) => Self::real(*r),
            Literal::Str(s) => Self::str(s.as_ref()),
        }
    }

    /// A reference marker carrying a slot index, produced by `LoadRef`.
    pub fn ref_marker(slot: SlotId) -> Self {
        Self {
            tag: Tag::Int,
            valid: Rep::INT.union(Rep::REF),
            ival: slot.index() as i64,
            ..Self::default()
        }
    }

    /// Whether this value is a reference marker.
    pub fn is_ref_marker(&self) -> bool {
        self.valid.contains(Rep::REF)
    }

    /// The slot a reference marker points at.
    pub fn marker_slot(&self) -> SlotId {
        SlotId::new(self.ival as u32)
    }

    /// The declared type.
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// The currently valid representation set.
    pub fn valid(&self) -> Rep {
        self.valid
    }

    /// The slot this value was loaded from, or [`SlotId::INVALID`].
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Whether the value is null.
    pub fn is_null(&self) -> bool {
        self.tag == Tag::Null
    }

    /// Whether the value is an array.
    pub fn is_array(&self) -> bool {
        self.tag == Tag::Array
    }

    /// Whether the value is an object.
    pub fn is_object(&self) -> bool {
        self.tag == Tag::Object
    }

    /// Whether the value is a string.
    pub fn is_str(&self) -> bool {
        self.tag == Tag::Str
    }

    /// The shared map of an array value.
    pub fn as_array(&self) -> Option<&Rc<RefCell<Hashmap>>> {
        match &self.aux {
            Aux::Array(map) => Some(map),
            _ => None,
        }
    }

    /// The shared instance of an object value.
    pub fn as_object(&self) -> Option<&Rc<RefCell<Instance>>> {
        match &self.aux {
            Aux::Object(instance) => Some(instance),
            _ => None,
        }
    }

    /// The aggregate payload.
    pub(crate) fn aux(&self) -> &Aux {
        &self.aux
    }

    /// The raw string bytes, valid when `STR` is in the representation set.
    pub fn str_bytes(&self) -> &[u8] {
        &self.blob
    }

    /// A human-readable name of the declared type.
    pub fn type_name(&self) -> &'static str {
        match self.tag {
            Tag::Null => "null",
            Tag::Bool => "bool",
            Tag::Int => "int",
            Tag::Real => "float",
            Tag::Str => "string",
            Tag::Array => "array",
            Tag::Object => "object",
            Tag::Resource => "resource",
        }
    }

    /// The signature character of the declared type (objects contribute
    /// their class name at a higher layer).
    pub fn signature_char(&self) -> char {
        match self.tag {
            Tag::Null => 'n',
            Tag::Bool => 'b',
            Tag::Int => 'i',
            Tag::Real => 'f',
            Tag::Str => 's',
            Tag::Array => 'a',
            Tag::Object => 'o',
            Tag::Resource => 'r',
        }
    }

    /// Deep-assign: replace this value's representation with `src`'s while
    /// keeping the destination slot binding.
    pub fn assign(&mut self, src: &Value) {
        self.tag = src.tag;
        self.valid = src.valid;
        self.ival = src.ival;
        self.rval = src.rval;
        self.blob.clear();
        self.blob.extend_from_slice(&src.blob);
        self.aux = src.aux.clone();
    }

    /// Release the representation back to null, keeping the slot binding.
    pub fn clear(&mut self) {
        self.tag = Tag::Null;
        self.valid = Rep::NULL;
        self.ival = 0;
        self.rval = 0.0;
        self.blob.clear();
        self.aux = Aux::None;
    }

    /// Detach the value from its slot, making it non-addressable.
    pub fn detached(mut self) -> Self {
        self.slot = SlotId::INVALID;
        self
    }

    // --- coercion ---------------------------------------------------------

    /// Truthiness: false, 0, 0.0, "", "0", null and the empty array are
    /// false; everything else is true.
    pub fn truthy(&self) -> bool {
        match self.tag {
            Tag::Null => false,
            Tag::Bool | Tag::Int => self.ival != 0,
            Tag::Real => self.rval != 0.0,
            Tag::Str => !(self.blob.is_empty() || self.blob == b"0"),
            Tag::Array => match &self.aux {
                Aux::Array(map) => !map.borrow().is_empty(),
                _ => false,
            },
            Tag::Object | Tag::Resource => true,
        }
    }

    /// The integer form without mutating the value.
    pub fn cast_int(&self) -> i64 {
        match self.tag {
            Tag::Bool | Tag::Int | Tag::Resource => self.ival,
            Tag::Real => self.rval as i64,
            Tag::Str => parse_numeric(&self.blob).as_int(),
            Tag::Array => match &self.aux {
                Aux::Array(map) if !map.borrow().is_empty() => 1,
                _ => 0,
            },
            Tag::Object => 1,
            Tag::Null => 0,
        }
    }

    /// The real form without mutating the value.
    pub fn cast_real(&self) -> f64 {
        match self.tag {
            Tag::Real => self.rval,
            Tag::Str => parse_numeric(&self.blob).as_real(),
            _ => self.cast_int() as f64,
        }
    }

    /// The numeric form without mutating the value.
    pub fn cast_numeric(&self) -> Numeric {
        match self.tag {
            Tag::Real => Numeric::Real(self.rval),
            Tag::Str => parse_numeric(&self.blob),
            _ => Numeric::Int(self.cast_int()),
        }
    }

    /// The string form without mutating the value. Aggregates degrade to
    /// their conventional placeholders; `__toString` routing happens in the
    /// dispatcher, which consults the class registry.
    pub fn cast_str(&self) -> Vec<u8> {
        match self.tag {
            Tag::Null => Vec::new(),
            Tag::Bool => {
                if self.ival != 0 {
                    b"1".to_vec()
                } else {
                    Vec::new()
                }
            }
            Tag::Int => self.ival.to_string().into_bytes(),
            Tag::Real => fmt_real(self.rval).into_bytes(),
            Tag::Str => self.blob.clone(),
            Tag::Array => b"Array".to_vec(),
            Tag::Object => b"Object".to_vec(),
            Tag::Resource => format!("Resource#{}", self.ival).into_bytes(),
        }
    }

    /// In-place coercion to bool.
    pub fn to_bool(&mut self) {
        let b = self.truthy();
        self.ival = b as i64;
        self.aux = Aux::None;
        self.tag = Tag::Bool;
        self.valid = Rep::BOOL;
    }

    /// In-place coercion to integer.
    pub fn to_int(&mut self) {
        let i = self.cast_int();
        self.ival = i;
        self.aux = Aux::None;
        self.tag = Tag::Int;
        self.valid = Rep::INT;
    }

    /// In-place coercion to real.
    pub fn to_real(&mut self) {
        let r = self.cast_real();
        self.rval = r;
        self.aux = Aux::None;
        self.tag = Tag::Real;
        self.valid = Rep::REAL;
    }

    /// In-place coercion to string. The previous scalar representation
    /// stays valid alongside the fresh blob.
    pub fn to_str(&mut self) {
        if self.tag == Tag::Str {
            return;
        }
        let bytes = self.cast_str();
        self.blob = bytes;
        self.aux = Aux::None;
        self.valid = (self.valid & (Rep::BOOL | Rep::INT | Rep::REAL)) | Rep::STR;
        self.tag = Tag::Str;
    }

    /// Byte-level string write: in-range offsets replace one byte, past
    /// the end appends exactly one byte regardless of the offset.
    pub fn str_byte_write(&mut self, offset: usize, byte: u8) {
        if self.tag != Tag::Str {
            self.to_str();
        }
        if offset < self.blob.len() {
            self.blob[offset] = byte;
        } else {
            self.blob.push(byte);
        }
        self.valid = Rep::STR;
    }

    /// In-place coercion to the numeric form.
    pub fn to_numeric(&mut self) {
        match self.cast_numeric() {
            Numeric::Int(i) => {
                self.ival = i;
                self.tag = Tag::Int;
                self.valid = Rep::INT;
            }
            Numeric::Real(r) => {
                self.rval = r;
                self.tag = Tag::Real;
                self.valid = Rep::REAL;
            }
        }
        self.aux = Aux::None;
    }

    // --- comparison -------------------------------------------------------

    /// Three-way comparison.
    ///
    /// In non-strict mode numeric-like strings compare numerically and
    /// arrays compare by size then entry-wise. In strict mode the declared
    /// types must match exactly; mismatched types order by type code.
    pub fn compare(&self, other: &Value, strict: bool, rt: &RefTable) -> Ordering {
        if strict && self.tag != other.tag {
            return self.tag.order().cmp(&other.tag.order());
        }

        match (self.tag, other.tag) {
            (Tag::Array, Tag::Array) => {
                let (a, b) = (self.as_array(), other.as_array());
                match (a, b) {
                    (Some(a), Some(b)) => compare_maps(&a.borrow(), &b.borrow(), strict, rt),
                    _ => Ordering::Equal,
                }
            }
            // Arrays order above every scalar.
            (Tag::Array, _) => Ordering::Greater,
            (_, Tag::Array) => Ordering::Less,
            (Tag::Object, Tag::Object) => {
                let (a, b) = (self.as_object(), other.as_object());
                match (a, b) {
                    (Some(a), Some(b)) if Rc::ptr_eq(a, b) => Ordering::Equal,
                    (Some(a), Some(b)) => compare_instances(&a.borrow(), &b.borrow(), strict, rt),
                    _ => Ordering::Equal,
                }
            }
            (Tag::Object, _) => Ordering::Greater,
            (_, Tag::Object) => Ordering::Less,
            (Tag::Str, Tag::Str) => {
                if !strict && is_numeric_str(&self.blob) && is_numeric_str(&other.blob) {
                    compare_numeric(self.cast_numeric(), other.cast_numeric())
                } else {
                    self.blob.cmp(&other.blob)
                }
            }
            (Tag::Null, Tag::Null) => Ordering::Equal,
            (Tag::Bool, _) | (_, Tag::Bool) if !strict => self.truthy().cmp(&other.truthy()),
            _ => compare_numeric(self.cast_numeric(), other.cast_numeric()),
        }
    }

    /// Loose equality shorthand.
    pub fn loose_eq(&self, other: &Value, rt: &RefTable) -> bool {
        self.compare(other, false, rt) == Ordering::Equal
    }

    /// Strict (type and value) equality shorthand.
    pub fn strict_eq(&self, other: &Value, rt: &RefTable) -> bool {
        self.tag == other.tag && self.compare(other, true, rt) == Ordering::Equal
    }
}

fn compare_maps(a: &Hashmap, b: &Hashmap, strict: bool, rt: &RefTable) -> Ordering {
    match a.len().cmp(&b.len()) {
        Ordering::Equal => {}
        order => return order,
    }
    for (key, a_slot) in a.iter() {
        let Some(b_slot) = b.get(key) else {
            return Ordering::Greater;
        };
        let order = rt.value(*a_slot).compare(rt.value(b_slot), strict, rt);
        if order != Ordering::Equal {
            return order;
        }
    }
    Ordering::Equal
}

fn compare_instances(a: &Instance, b: &Instance, strict: bool, rt: &RefTable) -> Ordering {
    if strict || a.class() != b.class() {
        // Distinct instances never compare strictly equal.
        return Ordering::Greater;
    }
    match a.attr_count().cmp(&b.attr_count()) {
        Ordering::Equal => {}
        order => return order,
    }
    for (name, a_slot) in a.attrs() {
        let Some(b_slot) = b.attr_slot(name) else {
            return Ordering::Greater;
        };
        let order = rt.value(*a_slot).compare(rt.value(b_slot), false, rt);
        if order != Ordering::Equal {
            return order;
        }
    }
    Ordering::Equal
}

fn compare_numeric(a: Numeric, b: Numeric) -> Ordering {
    match (a, b) {
        (Numeric::Int(a), Numeric::Int(b)) => a.cmp(&b),
        (a, b) => a
            .as_real()
            .partial_cmp(&b.as_real())
            .unwrap_or(Ordering::Equal),
    }
}

/// Parse the numeric prefix of a byte string: optional sign, digit run,
/// optional fraction, optional exponent. The result is an integer when no
/// fractional or exponent part appears.
pub fn parse_numeric(bytes: &[u8]) -> Numeric {
    let mut pos = 0;
    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    let start = pos;
    if pos < bytes.len() && (bytes[pos] == b'+' || bytes[pos] == b'-') {
        pos += 1;
    }
    let digits_start = pos;
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        pos += 1;
    }
    if pos == digits_start {
        return Numeric::Int(0);
    }
    let mut is_real = false;
    if pos < bytes.len() && bytes[pos] == b'.' {
        let frac_start = pos + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        if frac_end > frac_start {
            is_real = true;
            pos = frac_end;
        }
    }
    if pos < bytes.len() && (bytes[pos] == b'e' || bytes[pos] == b'E') {
        let mut exp_pos = pos + 1;
        if exp_pos < bytes.len() && (bytes[exp_pos] == b'+' || bytes[exp_pos] == b'-') {
            exp_pos += 1;
        }
        let exp_digits = exp_pos;
        while exp_pos < bytes.len() && bytes[exp_pos].is_ascii_digit() {
            exp_pos += 1;
        }
        if exp_pos > exp_digits {
            is_real = true;
            pos = exp_pos;
        }
    }

    let text = std::str::from_utf8(&bytes[start..pos]).unwrap_or("0");
    if is_real {
        Numeric::Real(text.parse().unwrap_or(0.0))
    } else {
        match text.parse::<i64>() {
            Ok(i) => Numeric::Int(i),
            // Digit run too long for the integer cell.
            Err(_) => Numeric::Real(text.parse().unwrap_or(0.0)),
        }
    }
}

/// Whether the whole byte string is a well-formed number.
pub fn is_numeric_str(bytes: &[u8]) -> bool {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|p| p + 1)
        .unwrap_or(start);
    let trimmed = &bytes[start..end];
    if trimmed.is_empty() {
        return false;
    }
    let mut pos = 0;
    if trimmed[pos] == b'+' || trimmed[pos] == b'-' {
        pos += 1;
    }
    let digits_start = pos;
    while pos < trimmed.len() && trimmed[pos].is_ascii_digit() {
        pos += 1;
    }
    if pos == digits_start {
        return false;
    }
    if pos < trimmed.len() && trimmed[pos] == b'.' {
        pos += 1;
        let frac_start = pos;
        while pos < trimmed.len() && trimmed[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos == frac_start {
            return false;
        }
    }
    if pos < trimmed.len() && (trimmed[pos] == b'e' || trimmed[pos] == b'E') {
        pos += 1;
        if pos < trimmed.len() && (trimmed[pos] == b'+' || trimmed[pos] == b'-') {
            pos += 1;
        }
        let exp_start = pos;
        while pos < trimmed.len() && trimmed[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos == exp_start {
            return false;
        }
    }
    pos == trimmed.len()
}

/// Format a real the way script output expects: integral values print
/// without a fractional part.
pub fn fmt_real(r: f64) -> String {
    if r.is_finite() && r == r.trunc() && r.abs() < 1e15 {
        format!("{}", r as i64)
    } else {
        format!("{r}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Value::null(), false)]
    #[case(Value::bool(false), false)]
    #[case(Value::int(0), false)]
    #[case(Value::real(0.0), false)]
    #[case(Value::str(""), false)]
    #[case(Value::str("0"), false)]
    #[case(Value::bool(true), true)]
    #[case(Value::int(-3), true)]
    #[case(Value::real(0.5), true)]
    #[case(Value::str("00"), true)]
    #[case(Value::str("phlox"), true)]
    fn truthiness(#[case] value: Value, #[case] expected: bool) {
        assert_eq!(value.truthy(), expected);
    }

    #[rstest]
    #[case(b"42", Numeric::Int(42))]
    #[case(b"-7", Numeric::Int(-7))]
    #[case(b"+13 apples", Numeric::Int(13))]
    #[case(b"3.5", Numeric::Real(3.5))]
    #[case(b"2e3", Numeric::Real(2000.0))]
    #[case(b"2.", Numeric::Int(2))]
    #[case(b"abc", Numeric::Int(0))]
    #[case(b"", Numeric::Int(0))]
    fn numeric_parse(#[case] input: &[u8], #[case] expected: Numeric) {
        assert_eq!(parse_numeric(input), expected);
    }

    #[rstest]
    #[case(b"42", true)]
    #[case(b" 42 ", true)]
    #[case(b"-1.25e2", true)]
    #[case(b"42x", false)]
    #[case(b"", false)]
    #[case(b".5", false)]
    fn numeric_detection(#[case] input: &[u8], #[case] expected: bool) {
        assert_eq!(is_numeric_str(input), expected);
    }

    #[test]
    fn string_coercion_caches_the_numeric_form() {
        let mut v = Value::int(5);
        v.to_str();
        assert_eq!(v.str_bytes(), b"5");
        assert!(v.valid().contains(Rep::INT));
        assert_eq!(v.cast_int(), 5);
    }

    #[test]
    fn coercions_are_idempotent() {
        let mut a = Value::str("12.5x");
        a.to_int();
        let first = a.cast_int();
        a.to_int();
        assert_eq!(a.cast_int(), first);

        let mut b = Value::real(2.5);
        b.to_str();
        let first = b.str_bytes().to_vec();
        b.to_str();
        assert_eq!(b.str_bytes(), &first[..]);
    }

    #[test]
    fn real_formatting() {
        assert_eq!(fmt_real(5.0), "5");
        assert_eq!(fmt_real(2.5), "2.5");
        assert_eq!(fmt_real(-0.0), "0");
    }

    #[test]
    fn strict_comparison_requires_matching_tags() {
        let rt = RefTable::new();
        assert!(Value::int(1).loose_eq(&Value::str("1"), &rt));
        assert!(!Value::int(1).strict_eq(&Value::str("1"), &rt));
        assert!(Value::str("10").loose_eq(&Value::str("1e1"), &rt));
    }
}
