use std::{fmt, str::FromStr};

use super::ProtocolError;

/// Declares a numeric wire code enum along with its conversions.
///
/// Every generated enum converts to its `u32` code, parses back from it (unknown codes are
/// an error), displays as its protocol name and parses from that name case-insensitively,
/// accepting `-` in place of `_`.
macro_rules! wire_codes {
    (
        $(#[$meta:meta])*
        $name:ident ($kind:literal) {
            $( $(#[$vmeta:meta])* $variant:ident = $code:literal => $text:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Numeric code carried on the wire.
            pub const fn code(self) -> u32 {
                match self {
                    $( $name::$variant => $code, )+
                }
            }

            /// Protocol name of the code.
            pub const fn name(self) -> &'static str {
                match self {
                    $( $name::$variant => $text, )+
                }
            }
        }

        impl From<$name> for u32 {
            fn from(value: $name) -> Self {
                value.code()
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                u64::from(value.code())
            }
        }

        impl TryFrom<u32> for $name {
            type Error = ProtocolError;

            fn try_from(code: u32) -> Result<Self, Self::Error> {
                match code {
                    $( $code => Ok($name::$variant), )+
                    code => Err(ProtocolError::UnknownCode { kind: $kind, code }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl FromStr for $name {
            type Err = ProtocolError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.trim().replace('-', "_");
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.name().eq_ignore_ascii_case(&wanted))
                    .ok_or_else(|| {
                        ProtocolError::InvalidArgument(format!("unknown {} '{s}'", $kind))
                    })
            }
        }
    };
}

wire_codes! {
    /// Commands understood by the appliance.
    Command("command") {
        /// Clear all appliance state, including loaded datasets.
        Reset = 0x00 => "RESET",
        DistanceMode = 0x01 => "DISTANCE_MODE",
        QueryMode = 0x02 => "QUERY_MODE",
        /// Set `k` for the k-NN query modes.
        ReadCount = 0x03 => "READ_COUNT",
        Threshold = 0x04 => "THRESHOLD",
        DsLoad = 0x05 => "DS_LOAD",
        Query = 0x06 => "QUERY",
        ResetTimer = 0x10 => "RESET_TIMER",
        /// Read the elapsed device time in nanoseconds.
        GetTimer = 0x11 => "GET_TIMER",
    }
}

wire_codes! {
    /// Result codes returned in the status field of a response header.
    Status("status") {
        Success = 0x00 => "SUCCESS",
        InvalidSequence = 0x01 => "INVALID_SEQUENCE",
        InvalidArgument = 0x02 => "INVALID_ARGUMENT",
        InvalidPacket = 0x03 => "INVALID_PACKET",
        NotSupported = 0x04 => "NOT_SUPPORTED",
        InvalidCommand = 0x05 => "INVALID_COMMAND",
        InvalidData = 0x06 => "INVALID_DATA",
        Timeout = 0x07 => "TIMEOUT",
        InvalidChecksum = 0x08 => "INVALID_CHECKSUM",
        InvalidApiKey = 0x09 => "INVALID_API_KEY",
        DatasetFileNotFound = 0x20 => "DATASET_FILE_NOT_FOUND",
        DatasetNotFound = 0x21 => "DATASET_NOT_FOUND",
        DatasetSizeNotSupported = 0x22 => "DATASET_SIZE_NOT_SUPPORTED",
        QuerySizeNotSupported = 0x23 => "QUERY_SIZE_NOT_SUPPORTED",
        DistanceModeNotSupported = 0x24 => "DISTANCE_MODE_NOT_SUPPORTED",
        QueryModeNotSupported = 0x25 => "QUERY_MODE_NOT_SUPPORTED",
        ReadCountNotSupported = 0x26 => "READ_COUNT_NOT_SUPPORTED",
        UnknownError = 0xFF => "UNKNOWN_ERROR",
    }
}

wire_codes! {
    /// Distance metric used by the appliance when comparing vectors.
    DistanceMode("distance mode") {
        /// Sum of absolute differences (Manhattan distance).
        L1 = 0x0000 => "L1",
        /// Largest absolute component difference.
        LMax = 0x0001 => "LMAX",
        /// Count of differing components.
        Hamming = 0x0002 => "HAMMING",
        /// Population count of the bitwise AND; 1-bit components only.
        BitAnd = 0x0003 => "BIT_AND",
        /// Population count of the bitwise OR; 1-bit components only.
        BitOr = 0x0004 => "BIT_OR",
        /// Intersection over union of bit sets.
        Jaccard = 0x0005 => "JACCARD",
        /// Unset.
        NoDistanceMode = 0xFFFF => "NO_DISTANCE_MODE",
    }
}

wire_codes! {
    /// How the appliance selects which dataset vectors to return for a query.
    QueryMode("query mode") {
        All = 0x0000 => "ALL",
        /// k best, lowest values first. Pair with a distance metric.
        KnnA = 0x0001 => "KNN_A",
        /// k best, highest values first. Pair with a similarity metric.
        KnnD = 0x0002 => "KNN_D",
        /// Values strictly greater than the threshold.
        Gt = 0x0003 => "GT",
        /// Values strictly less than the threshold.
        Lt = 0x0004 => "LT",
        Eq = 0x0005 => "EQ",
        /// Values between the lower and upper threshold.
        Range = 0x0006 => "RANGE",
        /// Unset.
        NoQueryMode = 0xFFFF => "NO_QUERY_MODE",
    }
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// Statuses after which the byte stream can no longer be trusted.
    pub fn indicates_desync(self) -> bool {
        matches!(self, Status::InvalidPacket | Status::InvalidChecksum)
    }
}

impl QueryMode {
    /// Whether results are bounded by the read count.
    pub fn is_knn(self) -> bool {
        matches!(self, QueryMode::KnnA | QueryMode::KnnD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for status in Status::ALL {
            assert_eq!(Status::try_from(status.code()).unwrap(), *status);
        }
        for command in Command::ALL {
            assert_eq!(Command::try_from(command.code()).unwrap(), *command);
        }
        assert_eq!(DistanceMode::try_from(0xFFFF).unwrap(), DistanceMode::NoDistanceMode);
        assert_eq!(QueryMode::try_from(6).unwrap(), QueryMode::Range);
    }

    #[test]
    fn command_codes_match_wire_values() {
        assert_eq!(Command::Reset.code(), 0x00);
        assert_eq!(Command::Query.code(), 0x06);
        assert_eq!(Command::ResetTimer.code(), 0x10);
        assert_eq!(Command::GetTimer.code(), 0x11);
        assert_eq!(Status::InvalidApiKey.code(), 0x09);
        assert_eq!(Status::ReadCountNotSupported.code(), 0x26);
    }

    #[test]
    fn unknown_code_is_rejected() {
        let err = Status::try_from(0x42).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnknownCode {
                kind: "status",
                code: 0x42
            }
        ));
    }

    #[test]
    fn modes_parse_from_names() {
        assert_eq!("knn-a".parse::<QueryMode>().unwrap(), QueryMode::KnnA);
        assert_eq!("KNN_D".parse::<QueryMode>().unwrap(), QueryMode::KnnD);
        assert_eq!("lmax".parse::<DistanceMode>().unwrap(), DistanceMode::LMax);
        assert_eq!(" bit_and ".parse::<DistanceMode>().unwrap(), DistanceMode::BitAnd);
        assert!("cosine".parse::<DistanceMode>().is_err());
    }

    #[test]
    fn status_displays_protocol_name() {
        assert_eq!(Status::DatasetNotFound.to_string(), "DATASET_NOT_FOUND");
    }
}
