/// implement [packbytes::FromBytes] and [packbytes::ToBytes] for a bilge
/// bitfield struct through its underlying integer representation
#[macro_export]
macro_rules! pack_bilge {
    ($t:ty, $repr:ty) => {

        impl packbytes::ToBytes for $t {
            type Bytes = [u8; core::mem::size_of::<$repr>()];

            fn to_le_bytes(self) -> Self::Bytes {
                <$repr>::from(self).to_le_bytes()
            }
            fn to_be_bytes(self) -> Self::Bytes {
                <$repr>::from(self).to_be_bytes()
            }
        }
        impl packbytes::FromBytes for $t {
            type Bytes = [u8; core::mem::size_of::<$repr>()];

            fn from_le_bytes(bytes: Self::Bytes) -> Self {
                <$t>::from(<$repr>::from_le_bytes(bytes))
            }
            fn from_be_bytes(bytes: Self::Bytes) -> Self {
                <$t>::from(<$repr>::from_be_bytes(bytes))
            }
        }
    };
}
