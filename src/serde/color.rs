use crate::color::{ColorRgb, ColorRgbExt};

pub fn serialize_color_as_hex<S: serde::ser::Serializer>(
    color: &ColorRgb,
    s: S,
) -> Result<S::Ok, S::Error> {
    s.serialize_str(&color.to_hex())
}
