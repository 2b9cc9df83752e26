use crate::db::StoreError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(StoreError::Validation {
                        field: stringify!($name),
                        reason: format!("unrecognized value: {s}"),
                    }),
                }
            }
        }
    };
}

str_enum!(Sex {
    Male => "male",
    Female => "female",
});

str_enum!(CivilStatus {
    Single => "single",
    Married => "married",
    Widowed => "widowed",
    Separated => "separated",
});

str_enum!(VisitType {
    New => "new",
    Encode => "encode",
});

str_enum!(Role {
    Admin => "admin",
    Staff => "staff",
});

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn round_trip_all_sex_values() {
        for sex in [Sex::Male, Sex::Female] {
            assert_eq!(Sex::from_str(sex.as_str()).unwrap(), sex);
        }
    }

    #[test]
    fn unrecognized_value_is_validation_error() {
        let err = Sex::from_str("unknown").unwrap_err();
        match err {
            StoreError::Validation { field, .. } => assert_eq!(field, "Sex"),
            other => panic!("expected Validation, got: {other}"),
        }
    }

    #[test]
    fn visit_type_default_wire_values() {
        assert_eq!(VisitType::New.as_str(), "new");
        assert_eq!(VisitType::Encode.as_str(), "encode");
    }
}
