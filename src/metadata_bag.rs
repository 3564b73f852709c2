//! Tagged-value container for the reconstruction metadata a task carries.
//!
//! Vendor headers mix standard and private tags, so the bag keys on the raw
//! DICOM tag and stores a sum over the value representations actually
//! touched. It serializes to JSON for the `recon_settings` column of a task.
use dicom::core::value::{PrimitiveValue, Value};
use dicom::core::{Tag, VR};
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, StandardDataDictionary};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

type Element = InMemElement<StandardDataDictionary>;

/// A DICOM tag as a map key, serialized as `"GGGG,EEEE"`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TagKey(pub Tag);

impl From<Tag> for TagKey {
    fn from(tag: Tag) -> Self {
        TagKey(tag)
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X},{:04X}", self.0.group(), self.0.element())
    }
}

impl Serialize for TagKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TagKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TagKeyVisitor;

        impl Visitor<'_> for TagKeyVisitor {
            type Value = TagKey;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a tag in \"GGGG,EEEE\" form")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<TagKey, E> {
                let (group, element) = v
                    .split_once(',')
                    .ok_or_else(|| E::custom(format!("not a tag: {v}")))?;
                let group = u16::from_str_radix(group, 16)
                    .map_err(|e| E::custom(format!("bad tag group: {e}")))?;
                let element = u16::from_str_radix(element, 16)
                    .map_err(|e| E::custom(format!("bad tag element: {e}")))?;
                Ok(TagKey(Tag(group, element)))
            }
        }

        deserializer.deserialize_str(TagKeyVisitor)
    }
}

/// Value of one bag entry, covering the VRs the pipeline reads or writes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TagValue {
    Str(String),
    Strs(Vec<String>),
    Int(i64),
    Ints(Vec<i64>),
    Float(f64),
    Floats(Vec<f64>),
    Bytes(Vec<u8>),
    Items(Vec<MetadataBag>),
}

impl TagValue {
    /// Convert a dataset element, recursing into sequences. Pixel data and
    /// empty values are dropped.
    pub fn from_element(element: &Element) -> Option<Self> {
        match element.value() {
            Value::Primitive(primitive) => Self::from_primitive(element.vr(), primitive),
            Value::Sequence(seq) => Some(TagValue::Items(
                seq.items().iter().map(MetadataBag::from_item).collect(),
            )),
            Value::PixelSequence(_) => None,
        }
    }

    fn from_primitive(vr: VR, value: &PrimitiveValue) -> Option<Self> {
        use PrimitiveValue as P;
        match value {
            P::Empty => None,
            P::U8(bytes) if matches!(vr, VR::OB | VR::OW | VR::UN) => {
                Some(TagValue::Bytes(bytes.to_vec()))
            }
            P::U8(v) => Some(ints(v.iter().map(|x| *x as i64))),
            P::I16(v) => Some(ints(v.iter().map(|x| *x as i64))),
            P::U16(v) => Some(ints(v.iter().map(|x| *x as i64))),
            P::I32(v) => Some(ints(v.iter().map(|x| *x as i64))),
            P::U32(v) => Some(ints(v.iter().map(|x| *x as i64))),
            P::I64(v) => Some(ints(v.iter().copied())),
            P::U64(v) => Some(ints(v.iter().map(|x| *x as i64))),
            P::F32(v) => Some(floats(v.iter().map(|x| *x as f64))),
            P::F64(v) => Some(floats(v.iter().copied())),
            other => Some(Self::from_strings(vr, other)),
        }
    }

    /// Strings with a numeric VR (decimal and integer strings) are parsed so
    /// lookups do not have to care how the element was encoded on the wire.
    fn from_strings(vr: VR, value: &PrimitiveValue) -> Self {
        let strings: Vec<String> = match value {
            PrimitiveValue::Strs(v) => v.iter().map(|s| s.trim().to_string()).collect(),
            PrimitiveValue::Str(s) => vec![s.trim().to_string()],
            other => vec![other.to_str().trim().to_string()],
        };
        if vr == VR::DS {
            if let Ok(parsed) = strings.iter().map(|s| s.parse::<f64>()).collect::<Result<Vec<_>, _>>() {
                return floats(parsed.into_iter());
            }
        }
        if vr == VR::IS {
            if let Ok(parsed) = strings.iter().map(|s| s.parse::<i64>()).collect::<Result<Vec<_>, _>>() {
                return ints(parsed.into_iter());
            }
        }
        if strings.len() == 1 {
            TagValue::Str(strings.into_iter().next().unwrap())
        } else {
            TagValue::Strs(strings)
        }
    }
}

fn ints(values: impl Iterator<Item = i64>) -> TagValue {
    let v: Vec<i64> = values.collect();
    if v.len() == 1 {
        TagValue::Int(v[0])
    } else {
        TagValue::Ints(v)
    }
}

fn floats(values: impl Iterator<Item = f64>) -> TagValue {
    let v: Vec<f64> = values.collect();
    if v.len() == 1 {
        TagValue::Float(v[0])
    } else {
        TagValue::Floats(v)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataBag(BTreeMap<TagKey, TagValue>);

impl MetadataBag {
    /// Collect the listed tags from a dataset. Absent tags are skipped.
    pub fn from_object_tags(obj: &InMemDicomObject, tags: &[Tag]) -> Self {
        let mut bag = Self::default();
        for tag in tags {
            if let Ok(element) = obj.element(*tag) {
                if let Some(value) = TagValue::from_element(element) {
                    bag.insert(*tag, value);
                }
            }
        }
        bag
    }

    /// Convert every element of a sequence item.
    pub fn from_item(obj: &InMemDicomObject) -> Self {
        let mut bag = Self::default();
        for element in obj {
            if let Some(value) = TagValue::from_element(element) {
                bag.insert(element.header().tag, value);
            }
        }
        bag
    }

    pub fn insert(&mut self, tag: Tag, value: TagValue) {
        self.0.insert(TagKey(tag), value);
    }

    pub fn get(&self, tag: Tag) -> Option<&TagValue> {
        self.0.get(&TagKey(tag))
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.0.contains_key(&TagKey(tag))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First string of the entry, if it reads as text.
    pub fn str_of(&self, tag: Tag) -> Option<&str> {
        match self.get(tag)? {
            TagValue::Str(s) => Some(s),
            TagValue::Strs(v) => v.first().map(String::as_str),
            _ => None,
        }
    }

    /// Integer value; little-endian byte content counts, which is how some
    /// vendors encode private numeric tags.
    pub fn int_of(&self, tag: Tag) -> Option<i64> {
        match self.get(tag)? {
            TagValue::Int(v) => Some(*v),
            TagValue::Ints(v) => v.first().copied(),
            TagValue::Float(v) => Some(*v as i64),
            TagValue::Str(s) => s.trim().parse().ok(),
            TagValue::Bytes(b) if b.len() <= 8 => {
                let mut buf = [0u8; 8];
                buf[..b.len()].copy_from_slice(b);
                Some(i64::from_le_bytes(buf))
            }
            _ => None,
        }
    }

    pub fn f64_of(&self, tag: Tag) -> Option<f64> {
        match self.get(tag)? {
            TagValue::Float(v) => Some(*v),
            TagValue::Floats(v) => v.first().copied(),
            TagValue::Int(v) => Some(*v as f64),
            TagValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn f64s_of(&self, tag: Tag) -> Option<Vec<f64>> {
        match self.get(tag)? {
            TagValue::Floats(v) => Some(v.clone()),
            TagValue::Float(v) => Some(vec![*v]),
            TagValue::Ints(v) => Some(v.iter().map(|x| *x as f64).collect()),
            TagValue::Int(v) => Some(vec![*v as f64]),
            TagValue::Strs(v) => v.iter().map(|s| s.trim().parse().ok()).collect(),
            TagValue::Str(s) => s.trim().parse().ok().map(|v| vec![v]),
            _ => None,
        }
    }

    /// Item of a sequence entry.
    pub fn item(&self, tag: Tag, index: usize) -> Option<&MetadataBag> {
        match self.get(tag)? {
            TagValue::Items(items) => items.get(index),
            _ => None,
        }
    }

    pub fn item_mut(&mut self, tag: Tag, index: usize) -> Option<&mut MetadataBag> {
        match self.0.get_mut(&TagKey(tag))? {
            TagValue::Items(items) => items.get_mut(index),
            _ => None,
        }
    }

    pub fn set_str(&mut self, tag: Tag, value: impl Into<String>) {
        self.insert(tag, TagValue::Str(value.into()));
    }

    pub fn set_f64(&mut self, tag: Tag, value: f64) {
        self.insert(tag, TagValue::Float(value));
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom::dictionary_std::tags;

    #[test]
    fn test_json_round_trip() {
        let mut bag = MetadataBag::default();
        bag.set_str(tags::MANUFACTURER, "SIEMENS");
        bag.insert(tags::PIXEL_SPACING, TagValue::Floats(vec![3.65, 3.65]));
        bag.insert(Tag(0x0009, 0x10B2), TagValue::Bytes(vec![3, 0]));
        let mut item = MetadataBag::default();
        item.set_str(tags::RADIOPHARMACEUTICAL, "FDG -- fluorodeoxyglucose");
        bag.insert(
            tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE,
            TagValue::Items(vec![item]),
        );

        let json = bag.to_json().unwrap();
        let back = MetadataBag::from_json(&json).unwrap();
        assert_eq!(back, bag);
        assert_eq!(
            back.item(tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE, 0)
                .and_then(|i| i.str_of(tags::RADIOPHARMACEUTICAL)),
            Some("FDG -- fluorodeoxyglucose")
        );
    }

    #[test]
    fn test_int_of_little_endian_bytes() {
        let mut bag = MetadataBag::default();
        bag.insert(Tag(0x0009, 0x10B2), TagValue::Bytes(vec![0x03, 0x00]));
        assert_eq!(bag.int_of(Tag(0x0009, 0x10B2)), Some(3));
    }

    #[test]
    fn test_item_patch() {
        let mut bag = MetadataBag::default();
        let item = MetadataBag::default();
        bag.insert(
            tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE,
            TagValue::Items(vec![item]),
        );
        bag.item_mut(tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE, 0)
            .unwrap()
            .set_str(tags::RADIOPHARMACEUTICAL, "Fluorine-18");
        assert_eq!(
            bag.item(tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE, 0)
                .and_then(|i| i.str_of(tags::RADIOPHARMACEUTICAL)),
            Some("Fluorine-18")
        );
    }
}
